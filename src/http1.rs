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

use crate::buffer::{Line, LineBuffer};
use log::debug;
use std::io::{self, Write};
use std::ops::Range;
use std::str;

pub const DEFAULT_DOCUMENT: &str = "/index.html";

fn parse_as_int(src: &[u8]) -> Result<usize, io::Error> {
    let int_str = match str::from_utf8(src) {
        Ok(s) => s,
        Err(_) => return Err(io::Error::from(io::ErrorKind::InvalidData)),
    };

    match int_str.parse() {
        Ok(x) => Ok(x),
        Err(_) => Err(io::Error::from(io::ErrorKind::InvalidData)),
    }
}

fn trim_ws(s: &[u8]) -> &[u8] {
    let is_ws = |b: &u8| *b == b' ' || *b == b'\t';

    let start = s.iter().position(|b| !is_ws(b)).unwrap_or(s.len());
    let end = s.iter().rposition(|b| !is_ws(b)).map_or(start, |p| p + 1);

    &s[start..end]
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseState {
    // next: Headers
    RequestLine,

    // next: Body, or complete
    Headers,

    // next: complete
    Body,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseStatus {
    Incomplete,
    Complete,
    Bad,
}

/// Incremental request parser. Feed it the same `LineBuffer` after every
/// read; it resumes where it left off.
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    method: Option<Method>,
    target: String,
    version: String,
    host: Option<String>,
    content_length: usize,
    keep_alive: bool,
    body: Option<Range<usize>>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: None,
            target: String::new(),
            version: String::new(),
            host: None,
            content_length: 0,
            keep_alive: false,
            body: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn is_form_submission(&self) -> bool {
        self.method == Some(Method::Post)
    }

    /// Location of the body within the buffer, once complete.
    pub fn body(&self) -> Option<Range<usize>> {
        self.body.clone()
    }

    pub fn parse(&mut self, buf: &mut LineBuffer) -> ParseStatus {
        loop {
            if self.state == ParseState::Body {
                if buf.unchecked().len() < self.content_length {
                    return ParseStatus::Incomplete;
                }

                self.body = Some(buf.consume(self.content_length));

                return ParseStatus::Complete;
            }

            let line = match buf.parse_line() {
                Line::Ok(r) => r,
                Line::Bad => return ParseStatus::Bad,
                Line::Open => {
                    // a line that can never end
                    if buf.is_full() {
                        debug!("request exceeds {} bytes", buf.capacity());
                        return ParseStatus::Bad;
                    }

                    return ParseStatus::Incomplete;
                }
            };

            let line = buf.get(line);

            let ret = match self.state {
                ParseState::RequestLine => self.parse_request_line(line),
                ParseState::Headers => self.parse_header(line),
                ParseState::Body => unreachable!(),
            };

            match ret {
                ParseStatus::Incomplete => {}
                ParseStatus::Bad => return ParseStatus::Bad,
                ParseStatus::Complete => {
                    if self.content_length == 0 {
                        return ParseStatus::Complete;
                    }

                    // the body must fit in what is left of the buffer
                    if self.content_length > buf.capacity() - buf.checked_index() {
                        debug!("content length {} too large", self.content_length);
                        return ParseStatus::Bad;
                    }

                    self.state = ParseState::Body;
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> ParseStatus {
        let line = match str::from_utf8(line) {
            Ok(s) => s,
            Err(_) => return ParseStatus::Bad,
        };

        let mut parts = line.split([' ', '\t']).filter(|s| !s.is_empty());

        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) => (m, t, v),
            _ => return ParseStatus::Bad,
        };

        if parts.next().is_some() {
            return ParseStatus::Bad;
        }

        self.method = if method.eq_ignore_ascii_case("GET") {
            Some(Method::Get)
        } else if method.eq_ignore_ascii_case("POST") {
            Some(Method::Post)
        } else {
            debug!("unsupported method {}", method);
            return ParseStatus::Bad;
        };

        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return ParseStatus::Bad;
        }

        let target = match strip_scheme(target) {
            Some(t) => t,
            None => return ParseStatus::Bad,
        };

        if !target.starts_with('/') {
            return ParseStatus::Bad;
        }

        self.target = if target == "/" {
            DEFAULT_DOCUMENT.to_string()
        } else {
            target.to_string()
        };

        self.version = version.to_string();
        self.state = ParseState::Headers;

        ParseStatus::Incomplete
    }

    /// Complete means the header block has ended.
    fn parse_header(&mut self, line: &[u8]) -> ParseStatus {
        if line.is_empty() {
            return ParseStatus::Complete;
        }

        let pos = match line.iter().position(|b| *b == b':') {
            Some(pos) => pos,
            None => {
                debug!("malformed header line");
                return ParseStatus::Incomplete;
            }
        };

        let name = trim_ws(&line[..pos]);
        let value = trim_ws(&line[(pos + 1)..]);

        if name.eq_ignore_ascii_case(b"Connection") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if name.eq_ignore_ascii_case(b"Content-Length") {
            match parse_as_int(value) {
                Ok(x) => self.content_length = x,
                Err(_) => return ParseStatus::Bad,
            }
        } else if name.eq_ignore_ascii_case(b"Host") {
            self.host = Some(String::from_utf8_lossy(value).into_owned());
        } else {
            debug!("ignoring header {}", String::from_utf8_lossy(name));
        }

        ParseStatus::Incomplete
    }
}

fn strip_scheme(target: &str) -> Option<&str> {
    for scheme in ["http://", "https://"] {
        let matched = match target.get(..scheme.len()) {
            Some(prefix) => prefix.eq_ignore_ascii_case(scheme),
            None => false,
        };

        if matched {
            let rest = &target[scheme.len()..];

            return rest.find('/').map(|pos| &rest[pos..]);
        }
    }

    Some(target)
}

/// Fixed pages served by path convention.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Page {
    Register,
    Login,
    LoginError,
    RegisterError,
    Menu,
    Picture,
    Video,
    About,
}

impl Page {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Register => "/register.html",
            Self::Login => "/log.html",
            Self::LoginError => "/logError.html",
            Self::RegisterError => "/registerError.html",
            Self::Menu => "/menu.html",
            Self::Picture => "/picture.html",
            Self::Video => "/video.html",
            Self::About => "/about.html",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Action {
    Login,
    Register,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Route {
    Page(Page),
    Action(Action),

    /// Serve the target as-is.
    File,
}

/// Selects what a target refers to, based on its last path segment.
pub fn route(target: &str, form_submission: bool) -> Route {
    let segment = match target.rfind('/') {
        Some(pos) => &target[(pos + 1)..],
        None => target,
    };

    let page = match segment {
        "register" => Some(Page::Register),
        "log" | "login" => Some(Page::Login),
        "menu" => Some(Page::Menu),
        "picture" => Some(Page::Picture),
        "video" => Some(Page::Video),
        "about" => Some(Page::About),
        _ => None,
    };

    if let Some(page) = page {
        return Route::Page(page);
    }

    match segment.as_bytes().first() {
        Some(b'0') => Route::Page(Page::Register),
        Some(b'1') => Route::Page(Page::Login),
        Some(b'2') if form_submission => Route::Action(Action::Login),
        Some(b'3') if form_submission => Route::Action(Action::Register),
        Some(b'4') => Route::Page(Page::Menu),
        Some(b'5') => Route::Page(Page::Picture),
        Some(b'6') => Route::Page(Page::Video),
        Some(b'7') => Route::Page(Page::About),
        _ => Route::File,
    }
}

/// Terminal outcome of a request.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HttpCode {
    BadRequest,
    NoResource,
    Forbidden,
    FileRequest,
    InternalError,
}

impl HttpCode {
    pub fn status(&self) -> u16 {
        match self {
            Self::FileRequest => 200,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::NoResource => 404,
            Self::InternalError => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::FileRequest => "OK",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NoResource => "Not Found",
            Self::InternalError => "Internal Error",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::FileRequest => "",
            Self::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Self::Forbidden => "You do not have permission to access the file from this server.\n",
            Self::NoResource => "The requested file was not found on this server.\n",
            Self::InternalError => "There was an unusual problem serving the requested file.\n",
        }
    }
}

pub const EMPTY_PAGE: &str = "<html><body></body></html>";

pub fn write_head<W: Write>(
    writer: &mut W,
    code: HttpCode,
    content_length: usize,
    keep_alive: bool,
) -> Result<(), io::Error> {
    write!(writer, "HTTP/1.1 {} {}\r\n", code.status(), code.reason())?;
    write!(writer, "Content-Length: {}\r\n", content_length)?;
    writer.write_all(b"Content-Type: text/html\r\n")?;

    if keep_alive {
        writer.write_all(b"Connection: keep-alive\r\n")?;
    } else {
        writer.write_all(b"Connection: close\r\n")?;
    }

    writer.write_all(b"\r\n")
}

/// Head and body of a canned response in one go.
pub fn write_canned<W: Write>(
    writer: &mut W,
    code: HttpCode,
    body: &str,
    keep_alive: bool,
) -> Result<(), io::Error> {
    write_head(writer, code, body.len(), keep_alive)?;

    writer.write_all(body.as_bytes())
}
