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

use crate::connection::{Connection, Next, Services, TriggerMode};
use crate::dispatch::{self, Dispatch, DispatchMode, Handoff};
use crate::signal::{self, Signal, SignalHandle, SignalPipe};
use crate::table::{Checkin, ConnectionTable};
use crate::timer::TimerList;
use crate::worker::{Completion, Notifier, PoolError, WorkerPool};
use log::{debug, error, info, warn};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

const LISTENER: Token = Token(0);
const SIGNALS: Token = Token(1);
const WAKER: Token = Token(2);

// connection tokens start here
const CONN_BASE: usize = 3;

const EVENTS_MAX: usize = 10_000;
const LISTEN_BACKLOG: i32 = 128;
const LINGER_TIMEOUT: Duration = Duration::from_secs(1);

// idle connections live for this many timeslots
const IDLE_TIMESLOTS: u32 = 3;

const BUSY_RESPONSE: &[u8] = b"Internal server busy";

// poll timeout while connections wait for queue space
const DEFER_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Binds a non-blocking listening socket.
pub fn bind(addr: SocketAddr, linger: bool) -> Result<TcpListener, io::Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;

    if linger {
        socket.set_linger(Some(LINGER_TIMEOUT))?;
    }

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    Ok(TcpListener::from_std(socket.into()))
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen_mode: TriggerMode,
    pub conn_mode: TriggerMode,
    pub timeslot: Duration,
    pub max_connections: usize,
    pub threads: usize,
    pub queue_size: usize,
    pub dispatch: DispatchMode,
}

/// The poll loop. Owns the listener, every idle connection and the timer
/// list. Connections leave the table while a worker has them.
pub struct Dispatcher {
    poll: Poll,
    listener: TcpListener,
    signals: SignalPipe,
    completions: mpsc::Receiver<Completion>,
    workers: WorkerPool,
    dispatch: Box<dyn Dispatch + Send>,
    conns: ConnectionTable,
    timers: TimerList,
    deferred: Vec<(usize, Next)>,
    listen_mode: TriggerMode,
    conn_mode: TriggerMode,
    timeslot: Duration,
    use_alarm: bool,
    tick_due: bool,
    stop: bool,
}

impl Dispatcher {
    pub fn new(
        mut listener: TcpListener,
        config: &DispatcherConfig,
        services: Arc<Services>,
    ) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        let registry = poll.registry();

        let mut signals = SignalPipe::new()?;

        registry.register(&mut listener, LISTENER, Interest::READABLE)?;
        registry.register(signals.source(), SIGNALS, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(registry, WAKER)?);
        let (s, completions) = mpsc::channel();

        let workers = WorkerPool::new(
            config.threads,
            config.queue_size,
            services,
            Notifier::new(s, waker),
        )?;

        Ok(Self {
            poll,
            listener,
            signals,
            completions,
            workers,
            dispatch: dispatch::strategy(config.dispatch),
            conns: ConnectionTable::new(config.max_connections),
            timers: TimerList::new(config.max_connections),
            deferred: Vec::new(),
            listen_mode: config.listen_mode,
            conn_mode: config.conn_mode,
            timeslot: config.timeslot,
            use_alarm: false,
            tick_due: false,
            stop: false,
        })
    }

    /// Routes process signals into the loop and drives idle sweeps from
    /// the alarm.
    pub fn install_signals(&mut self) -> Result<(), io::Error> {
        self.signals.install()?;
        self.use_alarm = true;

        Ok(())
    }

    pub fn signal_handle(&self) -> Result<SignalHandle, io::Error> {
        self.signals.handle()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    pub fn live_connections(&self) -> usize {
        self.conns.len()
    }

    fn arm_alarm(&self) {
        if self.use_alarm {
            signal::alarm(self.timeslot.as_secs().max(1) as u32);
        }
    }

    pub fn run(&mut self) -> Result<(), io::Error> {
        let mut events = Events::with_capacity(EVENTS_MAX);

        self.arm_alarm();

        while !self.stop {
            let timeout = if self.deferred.is_empty() {
                None
            } else {
                Some(DEFER_RETRY)
            };

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    SIGNALS => self.read_signals()?,
                    WAKER => self.drain_completions(),
                    token => self.conn_event(token.0 - CONN_BASE, event),
                }
            }

            self.retry_deferred();

            if self.tick_due {
                self.tick_due = false;

                self.tick();
                self.arm_alarm();
            }
        }

        info!("stopping with {} connections", self.conns.len());

        for mut conn in self.conns.drain() {
            if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
                debug!("deregister failed: {}", e);
            }
        }

        Ok(())
    }

    fn read_signals(&mut self) -> Result<(), io::Error> {
        let mut tick = false;
        let mut stop = false;

        self.signals.drain(|sig| match sig {
            Signal::Alarm => tick = true,
            Signal::Terminate => stop = true,
            Signal::Other(_) => {}
        })?;

        self.tick_due |= tick;
        self.stop |= stop;

        Ok(())
    }

    fn accept(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(ret) => ret,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            };

            self.add_connection(stream, peer);

            if self.listen_mode == TriggerMode::Level {
                // remaining connections notify again after re-arming
                if let Err(e) = self.poll.registry().reregister(
                    &mut self.listener,
                    LISTENER,
                    Interest::READABLE,
                ) {
                    error!("failed to re-arm listener: {}", e);
                }

                break;
            }
        }
    }

    fn add_connection(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.conns.is_full() {
            warn!("rejecting {}: {} connections", peer, self.conns.len());

            if let Err(e) = stream.write(BUSY_RESPONSE) {
                debug!("{}: busy response failed: {}", peer, e);
            }

            return;
        }

        let conn = Box::new(Connection::new(stream, peer, self.conn_mode));

        let key = match self.conns.insert(conn) {
            Ok(key) => key,
            Err(_) => return,
        };

        let token = Token(key + CONN_BASE);

        let ret = match self.conns.get_mut(key) {
            Some(conn) => {
                self.poll
                    .registry()
                    .register(conn.stream_mut(), token, Interest::READABLE)
            }
            None => return,
        };

        if let Err(e) = ret {
            error!("{}: register failed: {}", peer, e);
            self.close(key);
            return;
        }

        let deadline = self.idle_deadline();

        match self.timers.add(deadline, key) {
            Ok(timer) => self.conns.set_timer(key, Some(timer)),
            Err(e) => {
                error!("{}: timer add failed: {}", peer, e);
                self.close(key);
                return;
            }
        }

        debug!("accepted {} as {} ({} live)", peer, key, self.conns.len());
    }

    fn idle_deadline(&self) -> Instant {
        Instant::now() + self.timeslot * IDLE_TIMESLOTS
    }

    fn extend(&mut self, key: usize) {
        let deadline = self.idle_deadline();

        if let Some(timer) = self.conns.timer(key) {
            if let Err(e) = self.timers.adjust(timer, deadline) {
                debug!("timer {} not extended: {}", timer, e);
            }
        }
    }

    fn conn_event(&mut self, key: usize, event: &Event) {
        if !self.conns.contains(key) {
            return;
        }

        let hangup = event.is_error() || event.is_read_closed() || event.is_write_closed();

        if self.conns.is_in_flight(key) {
            // the worker's result decides everything else
            if hangup {
                self.close(key);
            }

            return;
        }

        if hangup {
            debug!("connection {} hung up", key);
            self.close(key);
            return;
        }

        let conn = match self.conns.checkout(key) {
            Some(conn) => conn,
            None => return,
        };

        let handoff = if event.is_readable() {
            self.dispatch.readable(&self.workers, key, conn)
        } else if event.is_writable() {
            self.dispatch.writable(&self.workers, key, conn)
        } else {
            self.finish(key, conn, Next::Read);
            return;
        };

        self.settle(key, handoff);
    }

    fn settle(&mut self, key: usize, handoff: Handoff) {
        match handoff {
            Handoff::Queued => self.extend(key),
            Handoff::Done(conn, next) => {
                if next != Next::Close {
                    self.extend(key);
                }

                self.finish(key, conn, next);
            }
            Handoff::Rejected(conn, next) => {
                // bytes already moved into the read buffer raise no further
                // readiness, so the handoff is retried on a short timeout
                self.finish(key, conn, next);

                if self.conns.contains(key) {
                    self.deferred.push((key, next));
                }
            }
        }
    }

    /// Offers connections rejected by a full queue to the dispatch strategy
    /// again.
    fn retry_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }

        for (key, next) in std::mem::take(&mut self.deferred) {
            // closed, or already picked up by a readiness event
            if !self.conns.contains(key) || self.conns.is_in_flight(key) {
                continue;
            }

            let conn = match self.conns.checkout(key) {
                Some(conn) => conn,
                None => continue,
            };

            let handoff = match next {
                Next::Write => self.dispatch.writable(&self.workers, key, conn),
                _ => self.dispatch.readable(&self.workers, key, conn),
            };

            self.settle(key, handoff);
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(c) = self.completions.try_recv() {
            self.finish(c.key, c.conn, c.next);
        }
    }

    /// Puts a connection back in its slot and re-arms the interest it asked
    /// for, or closes it.
    fn finish(&mut self, key: usize, conn: Box<Connection>, next: Next) {
        if let Checkin::Closed(conn) = self.conns.checkin(key, conn) {
            self.dispose(conn);
            return;
        }

        let interest = match next {
            Next::Read => Interest::READABLE,
            Next::Write => Interest::WRITABLE,
            Next::Close => {
                self.close(key);
                return;
            }
        };

        let ret = match self.conns.get_mut(key) {
            Some(conn) => {
                self.poll
                    .registry()
                    .reregister(conn.stream_mut(), Token(key + CONN_BASE), interest)
            }
            None => return,
        };

        if let Err(e) = ret {
            error!("connection {}: re-arm failed: {}", key, e);
            self.close(key);
        }
    }

    fn close(&mut self, key: usize) {
        let (conn, timer) = self.conns.close(key);

        if let Some(timer) = timer {
            self.timers.remove(timer);
        }

        if let Some(conn) = conn {
            self.dispose(conn);
        }
    }

    fn dispose(&mut self, mut conn: Box<Connection>) {
        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            debug!("{}: deregister failed: {}", conn.peer(), e);
        }

        debug!("closed {} ({} live)", conn.peer(), self.conns.len());
    }

    fn tick(&mut self) {
        let mut expired = Vec::new();

        self.timers.tick(Instant::now(), |key| expired.push(key));

        for key in expired.iter() {
            self.conns.set_timer(*key, None);
            self.close(*key);
        }

        debug!(
            "timer tick: {} expired, {} live",
            expired.len(),
            self.conns.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{Accounts, StoreSpec};
    use crate::connection::tests::{test_root, test_services};
    use signal_hook::consts::{SIGALRM, SIGTERM};
    use std::io::Read;
    use std::net::Shutdown;
    use std::os::unix::fs::PermissionsExt;
    use std::thread;
    use tempfile::TempDir;
    use test_log::test;

    struct TestServer {
        addr: SocketAddr,
        handle: SignalHandle,
        thread: Option<thread::JoinHandle<()>>,
        root: TempDir,
    }

    impl TestServer {
        fn new(
            dispatch: DispatchMode,
            listen_mode: TriggerMode,
            conn_mode: TriggerMode,
            max_connections: usize,
        ) -> Self {
            let root = test_root();

            let secret = root.path().join("secret.html");
            std::fs::write(&secret, "hidden").unwrap();
            std::fs::set_permissions(&secret, std::fs::Permissions::from_mode(0o600)).unwrap();

            let services = Arc::new(test_services(root.path()));

            let config = DispatcherConfig {
                listen_mode,
                conn_mode,
                timeslot: Duration::from_millis(20),
                max_connections,
                threads: 2,
                queue_size: 16,
                dispatch,
            };

            Self::start(root, services, &config)
        }

        fn start(root: TempDir, services: Arc<Services>, config: &DispatcherConfig) -> Self {
            let listener = bind("127.0.0.1:0".parse().unwrap(), false).unwrap();
            let mut d = Dispatcher::new(listener, config, services).unwrap();

            let addr = d.local_addr().unwrap();
            let handle = d.signal_handle().unwrap();

            let thread = thread::spawn(move || d.run().unwrap());

            Self {
                addr,
                handle,
                thread: Some(thread),
                root,
            }
        }

        fn connect(&self) -> std::net::TcpStream {
            let client = std::net::TcpStream::connect(self.addr).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();

            client
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.handle.send(SIGTERM).unwrap();

            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }
    }

    fn read_response(client: &mut std::net::TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0; 1];

        while !head.ends_with(b"\r\n\r\n") {
            let size = client.read(&mut byte).unwrap();
            assert_eq!(size, 1, "unexpected eof");
            head.push(byte[0]);
        }

        let head = String::from_utf8(head).unwrap();

        let len: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        let mut body = vec![0; len];
        client.read_exact(&mut body).unwrap();

        head + &String::from_utf8(body).unwrap()
    }

    fn assert_closed(client: &mut std::net::TcpStream) {
        let mut buf = [0; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    fn all_configs() -> Vec<(DispatchMode, TriggerMode, TriggerMode)> {
        let mut out = Vec::new();

        for dispatch in [DispatchMode::InLoop, DispatchMode::InWorker] {
            for listen in [TriggerMode::Level, TriggerMode::Edge] {
                for conn in [TriggerMode::Level, TriggerMode::Edge] {
                    out.push((dispatch, listen, conn));
                }
            }
        }

        out
    }

    #[test]
    fn keep_alive_requests() {
        for (dispatch, listen, conn) in all_configs() {
            let server = TestServer::new(dispatch, listen, conn, 64);
            let mut client = server.connect();

            client
                .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();

            let resp = read_response(&mut client);
            assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", dispatch);
            assert!(resp.contains("Connection: keep-alive\r\n"));
            assert!(resp.ends_with("<html>welcome</html>"));

            // same socket, next request
            client
                .write_all(b"GET /picture HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();

            let resp = read_response(&mut client);
            assert!(resp.ends_with("<html>gallery</html>"));

            client.write_all(b"GET /6 HTTP/1.1\r\n\r\n").unwrap();

            let resp = read_response(&mut client);
            assert!(resp.contains("Connection: close\r\n"));
            assert!(resp.ends_with("<html>video</html>"));
            assert_closed(&mut client);
        }
    }

    #[test]
    fn bad_method_closes() {
        for dispatch in [DispatchMode::InLoop, DispatchMode::InWorker] {
            let server = TestServer::new(dispatch, TriggerMode::Level, TriggerMode::Level, 64);
            let mut client = server.connect();

            client
                .write_all(b"PATCH / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();

            let resp = read_response(&mut client);
            assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
            assert!(resp.ends_with("Connection: close\r\n\r\n"));
            assert_closed(&mut client);
        }
    }

    #[test]
    fn resource_errors() {
        for dispatch in [DispatchMode::InLoop, DispatchMode::InWorker] {
            let server = TestServer::new(dispatch, TriggerMode::Edge, TriggerMode::Edge, 64);
            let mut client = server.connect();

            let cases = [
                ("/secret.html", "403 Forbidden"),
                ("/nothing.html", "404 Not Found"),
                ("/sub", "400 Bad Request"),
            ];

            for (path, status) in cases {
                let req = format!("GET {} HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", path);
                client.write_all(req.as_bytes()).unwrap();

                let resp = read_response(&mut client);
                assert!(resp.starts_with(&format!("HTTP/1.1 {}\r\n", status)));
                assert!(resp.contains("Connection: keep-alive\r\n"));
            }
        }
    }

    #[test]
    fn register_then_login() {
        for dispatch in [DispatchMode::InLoop, DispatchMode::InWorker] {
            let server = TestServer::new(dispatch, TriggerMode::Level, TriggerMode::Edge, 64);
            let mut client = server.connect();

            let post = |client: &mut std::net::TcpStream, path: &str, form: &str| {
                let req = format!(
                    "POST {} HTTP/1.1\r\nConnection: keep-alive\r\n\
                    Content-Type: application/x-www-form-urlencoded\r\n\
                    Content-Length: {}\r\n\r\n{}",
                    path,
                    form.len(),
                    form
                );

                client.write_all(req.as_bytes()).unwrap();

                read_response(client)
            };

            let resp = post(&mut client, "/2CGISQL.cgi", "user=bob&password=pw");
            assert!(resp.ends_with("<html>login failed</html>"));

            let resp = post(&mut client, "/3CGISQL.cgi", "user=bob&password=pw");
            assert!(resp.ends_with("<html>login</html>"));

            let resp = post(&mut client, "/2CGISQL.cgi", "user=bob&password=pw");
            assert!(resp.ends_with("<html>menu</html>"));

            let resp = post(&mut client, "/2CGISQL.cgi", "user=bob&password=nope");
            assert!(resp.ends_with("<html>login failed</html>"));
        }
    }

    #[test]
    fn busy_when_full() {
        let server = TestServer::new(DispatchMode::InLoop, TriggerMode::Level, TriggerMode::Level, 1);

        let mut first = server.connect();
        first
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        read_response(&mut first);

        let mut second = server.connect();

        let mut resp = Vec::new();
        second.read_to_end(&mut resp).unwrap();
        assert_eq!(resp, BUSY_RESPONSE);

        // the first connection is unaffected
        first
            .write_all(b"GET /7 HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(read_response(&mut first).ends_with("<html>about</html>"));
    }

    #[test]
    fn idle_connections_expire() {
        for dispatch in [DispatchMode::InLoop, DispatchMode::InWorker] {
            let server = TestServer::new(dispatch, TriggerMode::Level, TriggerMode::Level, 64);

            let mut idle = server.connect();
            idle.write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();
            read_response(&mut idle);

            // past three timeslots
            thread::sleep(Duration::from_millis(200));

            let mut fresh = server.connect();
            fresh
                .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();
            read_response(&mut fresh);

            server.handle.send(SIGALRM).unwrap();

            assert_closed(&mut idle);

            // the recently active connection survives the sweep
            fresh
                .write_all(b"GET /4 HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();
            assert!(read_response(&mut fresh).ends_with("<html>menu</html>"));
        }
    }

    #[test]
    fn split_request() {
        let server = TestServer::new(DispatchMode::InWorker, TriggerMode::Edge, TriggerMode::Level, 64);
        let mut client = server.connect();

        for part in [&b"GET /ab"[..], b"out HTTP/1.1\r", b"\nConnection: keep-alive\r\n", b"\r\n"] {
            client.write_all(part).unwrap();
            thread::sleep(Duration::from_millis(20));
        }

        assert!(read_response(&mut client).ends_with("<html>about</html>"));
    }

    #[test]
    fn large_file_to_slow_reader() {
        const SIZE: usize = 8 * 1024 * 1024;

        let body: Vec<u8> = (0..SIZE).map(|i| b'a' + (i % 26) as u8).collect();

        for dispatch in [DispatchMode::InLoop, DispatchMode::InWorker] {
            for conn in [TriggerMode::Level, TriggerMode::Edge] {
                let server = TestServer::new(dispatch, TriggerMode::Level, conn, 64);
                std::fs::write(server.root.path().join("big.html"), &body).unwrap();

                let mut client = server.connect();
                client
                    .write_all(b"GET /big.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                    .unwrap();

                // let the socket buffers fill so the server has to wait for
                // writability
                thread::sleep(Duration::from_millis(100));

                let resp = read_response(&mut client);
                assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
                assert!(resp.contains(&format!("Content-Length: {}\r\n", SIZE)));
                assert!(resp.as_bytes().ends_with(&body));

                client
                    .write_all(b"GET /7 HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                    .unwrap();
                assert!(read_response(&mut client).ends_with("<html>about</html>"));
            }
        }
    }

    #[test]
    fn half_close_releases_slot() {
        for dispatch in [DispatchMode::InLoop, DispatchMode::InWorker] {
            for conn in [TriggerMode::Level, TriggerMode::Edge] {
                let server = TestServer::new(dispatch, TriggerMode::Level, conn, 1);

                let mut first = server.connect();
                first
                    .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                    .unwrap();
                read_response(&mut first);

                first.shutdown(Shutdown::Write).unwrap();
                assert_closed(&mut first);

                // the only slot is free again
                let mut second = server.connect();
                second
                    .write_all(b"GET /7 HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                    .unwrap();
                assert!(read_response(&mut second).ends_with("<html>about</html>"));
            }
        }
    }

    #[test]
    fn hang_up_closes_in_loop() {
        let root = test_root();
        let services = Arc::new(test_services(root.path()));

        let config = DispatcherConfig {
            listen_mode: TriggerMode::Level,
            conn_mode: TriggerMode::Level,
            timeslot: Duration::from_secs(5),
            max_connections: 4,
            threads: 1,
            queue_size: 4,
            dispatch: DispatchMode::InLoop,
        };

        let listener = bind("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let mut d = Dispatcher::new(listener, &config, services).unwrap();

        let client = std::net::TcpStream::connect(d.local_addr().unwrap()).unwrap();

        let mut events = Events::with_capacity(16);

        let mut poll_once = |d: &mut Dispatcher| {
            d.poll
                .poll(&mut events, Some(Duration::from_millis(100)))
                .unwrap();

            for event in events.iter() {
                match event.token() {
                    LISTENER => d.accept(),
                    SIGNALS | WAKER => {}
                    token => d.conn_event(token.0 - CONN_BASE, event),
                }
            }
        };

        for _ in 0..20 {
            if d.live_connections() == 1 {
                break;
            }

            poll_once(&mut d);
        }
        assert_eq!(d.live_connections(), 1);
        assert_eq!(d.timers.len(), 1);

        client.shutdown(Shutdown::Both).unwrap();
        drop(client);

        for _ in 0..20 {
            if d.live_connections() == 0 {
                break;
            }

            poll_once(&mut d);
        }
        assert_eq!(d.live_connections(), 0);
        assert!(d.timers.is_empty());
    }

    #[test]
    fn full_queue_retries_buffered_request() {
        for dispatch in [DispatchMode::InLoop, DispatchMode::InWorker] {
            let root = test_root();

            let services = Arc::new(Services {
                root: root.path().to_path_buf(),
                accounts: Accounts::new(StoreSpec::Memory.open_pool(1).unwrap()),
            });

            let config = DispatcherConfig {
                listen_mode: TriggerMode::Level,
                conn_mode: TriggerMode::Edge,
                timeslot: Duration::from_secs(5),
                max_connections: 16,
                threads: 1,
                queue_size: 1,
                dispatch,
            };

            let server = TestServer::start(root, Arc::clone(&services), &config);

            // the only user table handle is held here, so a login stalls
            // the only worker
            let handle = services.accounts.pool().acquire().unwrap();

            let mut login = server.connect();
            let form = "user=bob&password=pw";
            let req = format!(
                "POST /2CGISQL.cgi HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n{}",
                form.len(),
                form
            );
            login.write_all(req.as_bytes()).unwrap();
            thread::sleep(Duration::from_millis(50));

            // occupies the queue
            let mut queued = server.connect();
            queued
                .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();
            thread::sleep(Duration::from_millis(50));

            // rejected by the full queue
            let mut rejected = server.connect();
            rejected
                .write_all(b"GET /7 HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();
            thread::sleep(Duration::from_millis(50));

            drop(handle);

            assert!(read_response(&mut login).ends_with("<html>login failed</html>"));
            assert!(read_response(&mut queued).ends_with("<html>welcome</html>"));
            assert!(read_response(&mut rejected).ends_with("<html>about</html>"));
        }
    }

    #[test]
    fn bind_with_linger() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), true).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }
}
