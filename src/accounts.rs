/*
 * Copyright (C) 2023 Fastly, Inc.
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

//! User credentials: the persistent user table, the pool of table handles,
//! and the in-memory cache consulted by login and registration forms.

use crate::pool::ResourcePool;
use log::{debug, error, info};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed row at line {0}")]
    Malformed(usize),

    #[error("user already exists")]
    Exists,

    #[error("field contains a reserved character")]
    InvalidField,

    #[error("invalid store spec: {0}")]
    InvalidSpec(String),
}

/// One open handle onto the user table.
pub trait UserTable: Send {
    fn lookup(&mut self, username: &str) -> Result<Option<String>, StoreError>;

    /// Fails with `StoreError::Exists` if the username is taken.
    fn insert(&mut self, username: &str, password: &str) -> Result<(), StoreError>;

    fn load_all(&mut self) -> Result<Vec<(String, String)>, StoreError>;
}

pub type TableHandle = Box<dyn UserTable>;

fn check_field(s: &str) -> Result<(), StoreError> {
    if s.is_empty() || s.contains(['\t', '\n', '\r']) {
        return Err(StoreError::InvalidField);
    }

    Ok(())
}

/// A flat table file of `username<TAB>password` rows. Every handle owns its
/// own descriptor; rows are appended with a single write.
pub struct FileTable {
    file: File,
}

impl FileTable {
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        Ok(Self { file })
    }

    fn rows(&mut self) -> Result<Vec<(String, String)>, StoreError> {
        self.file.seek(SeekFrom::Start(0))?;

        let mut out = Vec::new();

        for (i, line) in BufReader::new(&self.file).lines().enumerate() {
            let line = line?;

            if line.is_empty() {
                continue;
            }

            let (user, pass) = line.split_once('\t').ok_or(StoreError::Malformed(i + 1))?;

            out.push((user.to_string(), pass.to_string()));
        }

        Ok(out)
    }
}

impl UserTable for FileTable {
    fn lookup(&mut self, username: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .rows()?
            .into_iter()
            .find(|(u, _)| u == username)
            .map(|(_, p)| p))
    }

    fn insert(&mut self, username: &str, password: &str) -> Result<(), StoreError> {
        check_field(username)?;
        check_field(password)?;

        if self.lookup(username)?.is_some() {
            return Err(StoreError::Exists);
        }

        let row = format!("{}\t{}\n", username, password);
        self.file.write_all(row.as_bytes())?;

        Ok(())
    }

    fn load_all(&mut self) -> Result<Vec<(String, String)>, StoreError> {
        self.rows()
    }
}

/// Volatile table shared by all of its handles.
#[derive(Clone, Default)]
pub struct MemoryTable {
    rows: Arc<Mutex<HashMap<String, String>>>,
}

impl UserTable for MemoryTable {
    fn lookup(&mut self, username: &str) -> Result<Option<String>, StoreError> {
        Ok(self.rows.lock().unwrap().get(username).cloned())
    }

    fn insert(&mut self, username: &str, password: &str) -> Result<(), StoreError> {
        check_field(username)?;
        check_field(password)?;

        let rows = &mut *self.rows.lock().unwrap();

        if rows.contains_key(username) {
            return Err(StoreError::Exists);
        }

        rows.insert(username.to_string(), password.to_string());

        Ok(())
    }

    fn load_all(&mut self) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .map(|(u, p)| (u.clone(), p.clone()))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSpec {
    File(PathBuf),
    Memory,
}

impl FromStr for StoreSpec {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "memory" {
            return Ok(Self::Memory);
        }

        match s.strip_prefix("file:") {
            Some(path) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
            _ => Err(StoreError::InvalidSpec(s.to_string())),
        }
    }
}

impl StoreSpec {
    /// Opens `size` handles onto the table.
    pub fn open_pool(&self, size: usize) -> Result<ResourcePool<TableHandle>, StoreError> {
        match self {
            Self::File(path) => ResourcePool::new(size, || -> Result<TableHandle, StoreError> {
                Ok(Box::new(FileTable::open(path)?))
            }),
            Self::Memory => {
                let table = MemoryTable::default();

                ResourcePool::new(size, || -> Result<TableHandle, StoreError> {
                    Ok(Box::new(table.clone()))
                })
            }
        }
    }
}

/// Fields of a submitted login or registration form.
#[derive(Debug, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Decodes an `application/x-www-form-urlencoded` body by field name.
    pub fn from_form(body: &[u8]) -> Option<Self> {
        let mut user = None;
        let mut password = None;

        for (k, v) in url::form_urlencoded::parse(body) {
            match k.as_ref() {
                "user" => user = Some(v.into_owned()),
                "password" => password = Some(v.into_owned()),
                _ => {}
            }
        }

        let user = user.filter(|s| !s.is_empty())?;

        Some(Self {
            user,
            password: password?,
        })
    }
}

/// Credential cache in front of the pooled user table.
///
/// Lock order: a table handle may be held while taking the cache lock, never
/// the other way around.
pub struct Accounts {
    cache: Mutex<HashMap<String, String>>,
    pool: ResourcePool<TableHandle>,
}

impl Accounts {
    pub fn new(pool: ResourcePool<TableHandle>) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            pool,
        }
    }

    /// Loads every stored user into the cache.
    pub fn warm(&self) -> Result<usize, StoreError> {
        let rows = match self.pool.acquire() {
            Some(mut h) => h.load_all()?,
            None => return Ok(0),
        };

        let cache = &mut *self.cache.lock().unwrap();

        let count = rows.len();
        cache.extend(rows);

        Ok(count)
    }

    pub fn pool(&self) -> &ResourcePool<TableHandle> {
        &self.pool
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Adds a new user. Returns false if the name is taken or the store
    /// refuses the row.
    pub fn register(&self, creds: &Credentials) -> bool {
        let mut h = match self.pool.acquire() {
            Some(h) => h,
            None => {
                error!("no user table handles configured");
                return false;
            }
        };

        let cache = &mut *self.cache.lock().unwrap();

        if cache.contains_key(&creds.user) {
            debug!("register {}: already cached", creds.user);
            return false;
        }

        match h.insert(&creds.user, &creds.password) {
            Ok(()) => {
                info!("registered user {}", creds.user);

                cache.insert(creds.user.clone(), creds.password.clone());

                true
            }
            Err(StoreError::Exists) => {
                debug!("register {}: already stored", creds.user);
                false
            }
            Err(e) => {
                error!("register {}: {}", creds.user, e);
                false
            }
        }
    }

    pub fn login(&self, creds: &Credentials) -> bool {
        if let Some(p) = self.cache.lock().unwrap().get(&creds.user) {
            return *p == creds.password;
        }

        let stored = {
            let mut h = match self.pool.acquire() {
                Some(h) => h,
                None => return false,
            };

            match h.lookup(&creds.user) {
                Ok(p) => p,
                Err(e) => {
                    error!("login {}: {}", creds.user, e);
                    return false;
                }
            }
        };

        match stored {
            Some(p) => {
                let ok = p == creds.password;

                self.cache.lock().unwrap().insert(creds.user.clone(), p);

                ok
            }
            None => false,
        }
    }
}
