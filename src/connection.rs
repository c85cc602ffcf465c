/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! One client connection: buffered reads, request parsing, response
//! composition and vectored writes.
//!
//! A `Connection` never touches the poller. It reports what it wants next
//! and the owner of the poll registration acts on that. This keeps it free
//! to move between the dispatcher thread and a worker.

use crate::accounts::{Accounts, Credentials};
use crate::buffer::{write_vectored_offset, LineBuffer, ResponseBuffer, READ_BUFFER_SIZE};
use crate::fs::{self, FileMap, Resource};
use crate::http1::{
    self, Action, HttpCode, Method, Page, ParseStatus, RequestParser, Route, EMPTY_PAGE,
};
use log::{debug, error, info};
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Level,
    Edge,
}

/// What a connection wants after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Read,
    Write,
    Close,
}

/// Shared read-only state handed to request processing.
pub struct Services {
    pub root: PathBuf,
    pub accounts: Accounts,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    mode: TriggerMode,
    rbuf: LineBuffer,
    parser: RequestParser,
    wbuf: ResponseBuffer,
    file: Option<FileMap>,
    bytes_to_send: usize,
    bytes_sent: usize,
    linger: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, mode: TriggerMode) -> Self {
        Self {
            stream,
            peer,
            mode,
            rbuf: LineBuffer::new(READ_BUFFER_SIZE),
            parser: RequestParser::new(),
            wbuf: ResponseBuffer::new(),
            file: None,
            bytes_to_send: 0,
            bytes_sent: 0,
            linger: false,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    pub fn bytes_to_send(&self) -> usize {
        self.bytes_to_send
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Returns the connection to its initial parse state, ready for the
    /// next request. Any mapped file is released.
    pub fn reset(&mut self) {
        self.rbuf.clear();
        self.parser.reset();
        self.wbuf.clear();
        self.file = None;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.linger = false;
    }

    /// Reads what the socket has. Returns false if the connection should be
    /// closed: peer closed, hard error, or no room left to read into.
    pub fn receive(&mut self) -> bool {
        if self.rbuf.is_full() {
            return false;
        }

        match self.mode {
            TriggerMode::Level => match self.rbuf.write_from(&mut self.stream) {
                Ok(0) => false,
                Ok(_) => true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
                Err(e) => {
                    debug!("{}: read failed: {}", self.peer, e);
                    false
                }
            },
            TriggerMode::Edge => loop {
                if self.rbuf.is_full() {
                    // let the parser decide whether this is too much
                    return true;
                }

                match self.rbuf.write_from(&mut self.stream) {
                    Ok(0) => return false,
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("{}: read failed: {}", self.peer, e);
                        return false;
                    }
                }
            },
        }
    }

    /// Advances the parser over received bytes and, once a request is
    /// complete, prepares its response.
    pub fn process(&mut self, services: &Services) -> Next {
        match self.parser.parse(&mut self.rbuf) {
            ParseStatus::Incomplete => Next::Read,
            ParseStatus::Bad => {
                debug!("{}: bad request", self.peer);

                if self.reject() {
                    Next::Write
                } else {
                    Next::Close
                }
            }
            ParseStatus::Complete => {
                let code = self.do_request(services);

                info!(
                    "{} {} {} -> {}",
                    self.peer,
                    match self.parser.method() {
                        Some(Method::Post) => "POST",
                        _ => "GET",
                    },
                    self.parser.target(),
                    code.status()
                );

                if self.compose(code) {
                    Next::Write
                } else {
                    Next::Close
                }
            }
        }
    }

    fn do_request(&mut self, services: &Services) -> HttpCode {
        let target = self.parser.target().to_string();

        let path = match http1::route(&target, self.parser.is_form_submission()) {
            Route::Page(page) => page.path(),
            Route::Action(action) => {
                let creds = self
                    .parser
                    .body()
                    .and_then(|r| Credentials::from_form(self.rbuf.get(r)));

                self.run_action(action, creds, &services.accounts).path()
            }
            Route::File => target.as_str(),
        };

        let path = match resolve(&services.root, path) {
            Some(path) => path,
            None => return HttpCode::Forbidden,
        };

        match fs::inspect(&path) {
            Resource::Missing => HttpCode::NoResource,
            Resource::Forbidden => HttpCode::Forbidden,
            Resource::Directory => HttpCode::BadRequest,
            Resource::File { size: 0 } => HttpCode::FileRequest,
            Resource::File { .. } => match FileMap::open(&path) {
                Ok(map) => {
                    self.file = Some(map);

                    HttpCode::FileRequest
                }
                Err(e) => {
                    error!("{}: failed to map {}: {}", self.peer, path.display(), e);

                    HttpCode::NoResource
                }
            },
        }
    }

    fn run_action(&self, action: Action, creds: Option<Credentials>, accounts: &Accounts) -> Page {
        let ok = match &creds {
            Some(c) => match action {
                Action::Login => accounts.login(c),
                Action::Register => accounts.register(c),
            },
            None => {
                debug!("{}: form without user and password", self.peer);
                false
            }
        };

        match (action, ok) {
            (Action::Login, true) => Page::Menu,
            (Action::Login, false) => Page::LoginError,
            (Action::Register, true) => Page::Login,
            (Action::Register, false) => Page::RegisterError,
        }
    }

    /// Writes the response head, and canned bodies, into the write buffer.
    /// Returns false if not even an error response fits.
    fn compose(&mut self, code: HttpCode) -> bool {
        let keep_alive = self.parser.keep_alive();

        self.wbuf.clear();

        let ret = match (code, &self.file) {
            (HttpCode::FileRequest, Some(map)) => {
                http1::write_head(&mut self.wbuf, code, map.len(), keep_alive)
            }
            (HttpCode::FileRequest, None) => {
                http1::write_canned(&mut self.wbuf, code, EMPTY_PAGE, keep_alive)
            }
            (code, _) => http1::write_canned(&mut self.wbuf, code, code.message(), keep_alive),
        };

        if ret.is_err() {
            self.file = None;
            self.wbuf.clear();

            let code = HttpCode::InternalError;

            if http1::write_canned(&mut self.wbuf, code, code.message(), keep_alive).is_err() {
                return false;
            }
        }

        self.linger = keep_alive;
        self.bytes_sent = 0;
        self.bytes_to_send = self.wbuf.len() + self.file.as_ref().map_or(0, |m| m.len());

        true
    }

    /// Parse-level rejection: no body, and the connection closes once
    /// the response drains.
    fn reject(&mut self) -> bool {
        self.file = None;
        self.wbuf.clear();

        if http1::write_head(&mut self.wbuf, HttpCode::BadRequest, 0, false).is_err() {
            return false;
        }

        self.linger = false;
        self.bytes_sent = 0;
        self.bytes_to_send = self.wbuf.len();

        true
    }

    /// Sends as much of the pending response as the socket takes.
    ///
    /// Returns `Next::Write` if the socket filled up, `Next::Read` if the
    /// response drained and the connection was reset for the next request,
    /// or `Next::Close` if it drained and the connection should close.
    pub fn write(&mut self) -> Result<Next, io::Error> {
        while self.bytes_sent < self.bytes_to_send {
            let file: &[u8] = match &self.file {
                Some(map) => &map[..],
                None => &[],
            };

            let bufs: [&[u8]; 2] = [&self.wbuf[..], file];

            match write_vectored_offset(&mut self.stream, &bufs, self.bytes_sent) {
                Ok(0) => {
                    self.file = None;

                    return Err(io::Error::from(io::ErrorKind::WriteZero));
                }
                Ok(size) => self.bytes_sent += size,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Next::Write),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.file = None;

                    return Err(e);
                }
            }
        }

        if self.linger {
            self.reset();

            Ok(Next::Read)
        } else {
            self.file = None;

            Ok(Next::Close)
        }
    }
}

/// Joins a request target onto the document root. Targets that climb out
/// of the root are refused.
fn resolve(root: &Path, target: &str) -> Option<PathBuf> {
    let rel = Path::new(target.trim_start_matches('/'));

    for c in rel.components() {
        match c {
            Component::Normal(_) | Component::CurDir => {}
            _ => return None,
        }
    }

    Some(root.join(rel))
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::accounts::StoreSpec;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    pub fn test_root() -> TempDir {
        let dir = TempDir::new().unwrap();

        let pages = [
            ("index.html", "<html>welcome</html>"),
            ("register.html", "<html>register</html>"),
            ("log.html", "<html>login</html>"),
            ("logError.html", "<html>login failed</html>"),
            ("registerError.html", "<html>register failed</html>"),
            ("menu.html", "<html>menu</html>"),
            ("picture.html", "<html>gallery</html>"),
            ("video.html", "<html>video</html>"),
            ("about.html", "<html>about</html>"),
            ("empty.html", ""),
        ];

        for (name, content) in pages {
            std::fs::write(dir.path().join(name), content).unwrap();
        }

        std::fs::create_dir(dir.path().join("sub")).unwrap();

        dir
    }

    pub fn test_services(root: &Path) -> Services {
        Services {
            root: root.to_path_buf(),
            accounts: Accounts::new(StoreSpec::Memory.open_pool(2).unwrap()),
        }
    }

    fn pair(mode: TriggerMode) -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        (
            Connection::new(TcpStream::from_std(stream), peer, mode),
            client,
        )
    }

    fn recv_until_ready(c: &mut Connection, services: &Services) -> Next {
        for _ in 0..500 {
            assert!(c.receive());

            match c.process(services) {
                Next::Read => thread::sleep(Duration::from_millis(10)),
                next => return next,
            }
        }

        panic!("request never completed");
    }

    fn exchange(
        c: &mut Connection,
        client: &mut std::net::TcpStream,
        services: &Services,
        req: &[u8],
    ) -> (Next, String) {
        client.write_all(req).unwrap();

        assert_eq!(recv_until_ready(c, services), Next::Write);

        let expected = c.bytes_to_send();
        let next = c.write().unwrap();

        let mut resp = vec![0; expected];
        client.read_exact(&mut resp).unwrap();

        (next, String::from_utf8(resp).unwrap())
    }

    #[test]
    fn keep_alive_get() {
        let root = test_root();
        let services = test_services(root.path());

        for mode in [TriggerMode::Level, TriggerMode::Edge] {
            let (mut c, mut client) = pair(mode);

            let (next, resp) = exchange(
                &mut c,
                &mut client,
                &services,
                b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
            );

            assert_eq!(next, Next::Read);
            assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(resp.contains("Content-Length: 20\r\n"));
            assert!(resp.contains("Connection: keep-alive\r\n"));
            assert!(resp.ends_with("\r\n\r\n<html>welcome</html>"));

            // connection was reset and serves another request
            assert_eq!(c.bytes_to_send(), 0);

            let (next, resp) = exchange(
                &mut c,
                &mut client,
                &services,
                b"GET /5 HTTP/1.1\r\n\r\n",
            );

            assert_eq!(next, Next::Close);
            assert!(resp.contains("Connection: close\r\n"));
            assert!(resp.ends_with("<html>gallery</html>"));
        }
    }

    #[test]
    fn resource_errors_keep_connection() {
        let root = test_root();
        let services = test_services(root.path());
        let (mut c, mut client) = pair(TriggerMode::Level);

        let cases: &[(&[u8], &str)] = &[
            (b"GET /missing.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", "404 Not Found"),
            (b"GET /sub HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", "400 Bad Request"),
            (b"GET /../etc/passwd HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", "403 Forbidden"),
        ];

        for (req, status) in cases {
            let (next, resp) = exchange(&mut c, &mut client, &services, req);

            assert_eq!(next, Next::Read);
            assert!(resp.starts_with(&format!("HTTP/1.1 {}\r\n", status)), "{}", resp);
            assert!(resp.contains("Connection: keep-alive\r\n"));
        }
    }

    #[test]
    fn empty_file_served_as_blank_page() {
        let root = test_root();
        let services = test_services(root.path());
        let (mut c, mut client) = pair(TriggerMode::Level);

        let (_, resp) = exchange(&mut c, &mut client, &services, b"GET /empty.html HTTP/1.1\r\n\r\n");

        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.ends_with("\r\n\r\n<html><body></body></html>"));
    }

    #[test]
    fn bad_request_closes() {
        let root = test_root();
        let services = test_services(root.path());
        let (mut c, mut client) = pair(TriggerMode::Edge);

        let (next, resp) = exchange(
            &mut c,
            &mut client,
            &services,
            b"PATCH / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        );

        assert_eq!(next, Next::Close);
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(resp.contains("Content-Length: 0\r\n"));
        assert!(resp.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn register_then_login() {
        let root = test_root();
        let services = test_services(root.path());
        let (mut c, mut client) = pair(TriggerMode::Level);

        let form = "user=alice&password=pw";

        let post = |path: &str| {
            format!(
                "POST {} HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n{}",
                path,
                form.len(),
                form
            )
        };

        let (_, resp) = exchange(&mut c, &mut client, &services, post("/2CGISQL.cgi").as_bytes());
        assert!(resp.ends_with("<html>login failed</html>"));

        let (_, resp) = exchange(&mut c, &mut client, &services, post("/3CGISQL.cgi").as_bytes());
        assert!(resp.ends_with("<html>login</html>"));

        let (_, resp) = exchange(&mut c, &mut client, &services, post("/2CGISQL.cgi").as_bytes());
        assert!(resp.ends_with("<html>menu</html>"));

        let (_, resp) = exchange(&mut c, &mut client, &services, post("/3CGISQL.cgi").as_bytes());
        assert!(resp.ends_with("<html>register failed</html>"));
    }

    #[test]
    fn peer_close_is_reported() {
        let (mut c, client) = pair(TriggerMode::Edge);
        drop(client);

        let mut closed = false;

        for _ in 0..500 {
            if !c.receive() {
                closed = true;
                break;
            }

            thread::sleep(Duration::from_millis(10));
        }

        assert!(closed);
    }

    #[test]
    fn resolve_stays_in_root() {
        let root = Path::new("/srv/www");

        assert_eq!(
            resolve(root, "/index.html"),
            Some(PathBuf::from("/srv/www/index.html"))
        );
        assert_eq!(
            resolve(root, "/a/b.html"),
            Some(PathBuf::from("/srv/www/a/b.html"))
        );
        assert_eq!(resolve(root, "/a/../../x"), None);
    }
}
