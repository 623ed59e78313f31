use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use crate::config::{RequestContext, SessionConfig};
use crate::driver::{Error, RecordState, Result, SessionDriver, unix_now};
use crate::fingerprint::Fingerprint;
use crate::id;

/// Hex length of the client-address segment embedded in file names when
/// `match_ip` is enabled.
const IP_HASH_LEN: usize = 32;

/// A filesystem session driver.
///
/// Stores one file per session, named `<cookie_name>[<ip_hash>]<session_id>`,
/// directly under the configured directory. The exclusive advisory lock on
/// the open file doubles as the session lock: acquired in `read`, held until
/// `close`, and contended at OS level by any other process opening the same
/// session file.
pub struct FilesDriver {
    config: SessionConfig,
    save_path: PathBuf,
    name: String,
    handle: Option<SessionFile>,
    current_id: Option<String>,
    record: RecordState,
    fingerprint: Fingerprint,
    opened: bool,
}

struct SessionFile {
    file: File,
    path: PathBuf,
}

impl FilesDriver {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            save_path: PathBuf::new(),
            name: String::new(),
            handle: None,
            current_id: None,
            record: RecordState::Absent,
            fingerprint: Fingerprint::empty(),
            opened: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened {
            Ok(())
        } else {
            Err(Error::Config(
                "files driver used before open()".to_string(),
            ))
        }
    }

    fn session_path(&self, ctx: &RequestContext, session_id: &str) -> Result<PathBuf> {
        let mut file_name =
            String::with_capacity(self.name.len() + IP_HASH_LEN + session_id.len());
        file_name.push_str(&self.name);
        if self.config.match_ip {
            let addr = ctx.addr_string().ok_or(Error::AddressRequired)?;
            file_name.push_str(&ip_hash(&addr));
        }
        file_name.push_str(session_id);
        Ok(self.save_path.join(file_name))
    }

    /// Whether a directory entry is one of our session files. Anything not
    /// matching the cookie-name prefix plus the exact hex length is never
    /// touched by gc.
    fn matches_session_file(&self, file_name: &str) -> bool {
        let Some(rest) = file_name.strip_prefix(self.name.as_str()) else {
            return false;
        };
        let expected_len = if self.config.match_ip {
            IP_HASH_LEN + id::ID_LEN
        } else {
            id::ID_LEN
        };
        rest.len() == expected_len && rest.bytes().all(is_hex_lower)
    }

    /// Opens (creating if needed) and exclusively locks the session file,
    /// then reads its contents. On lock failure the session degrades to
    /// empty and no lock is retained.
    fn acquire_and_load(&mut self, ctx: &RequestContext, session_id: &str) -> Result<Vec<u8>> {
        let path = self.session_path(ctx, session_id)?;
        let new_file = !path.exists();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(err) = file.lock_exclusive() {
            tracing::warn!(path = %path.display(), err = %err, "session lock unavailable");
            self.fingerprint = Fingerprint::empty();
            return Ok(Vec::new());
        }

        self.current_id = Some(session_id.to_string());

        if new_file {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
            }

            self.handle = Some(SessionFile { file, path });
            self.record = RecordState::Absent;
            self.fingerprint = Fingerprint::empty();
            return Ok(Vec::new());
        }

        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;
        self.handle = Some(SessionFile { file, path });

        self.record = RecordState::Present;
        self.fingerprint = Fingerprint::of(&data);
        Ok(data)
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.file.unlock() {
                tracing::warn!(path = %handle.path.display(), err = %err, "failed to unlock session file");
            }
        }
        self.current_id = None;
        self.record = RecordState::Absent;
    }
}

#[async_trait]
impl SessionDriver for FilesDriver {
    async fn open(&mut self, save_path: &str, name: &str) -> Result<()> {
        let path = PathBuf::from(save_path);
        if !path.is_dir() {
            fs::create_dir_all(&path).map_err(|err| {
                Error::Config(format!(
                    "save path '{save_path}' is not a directory and cannot be created: {err}"
                ))
            })?;
        }

        let meta = fs::metadata(&path)
            .map_err(|err| Error::Config(format!("save path '{save_path}': {err}")))?;
        if meta.permissions().readonly() {
            return Err(Error::Config(format!(
                "save path '{save_path}' is not writable"
            )));
        }

        self.save_path = path;
        self.name = name.to_string();
        self.opened = true;
        Ok(())
    }

    async fn read(&mut self, ctx: &RequestContext, session_id: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;

        // A lock held for a different id is released before anything else.
        if self.current_id.as_deref() != Some(session_id) {
            self.release();
        }

        let Some(handle) = self.handle.as_mut() else {
            return self.acquire_and_load(ctx, session_id);
        };

        // Re-read through the handle we already hold.
        let mut data = Vec::new();
        handle.file.seek(SeekFrom::Start(0))?;
        handle.file.read_to_end(&mut data)?;
        self.fingerprint = Fingerprint::of(&data);
        Ok(data)
    }

    async fn write(&mut self, ctx: &RequestContext, session_id: &str, data: &[u8]) -> Result<()> {
        self.ensure_open()?;

        if self.current_id.as_deref() != Some(session_id) {
            // Id regenerated mid-request: move the lock to the new id.
            self.release();
            self.acquire_and_load(ctx, session_id)?;
            if self.handle.is_none() {
                return Err(Error::LockUnavailable(session_id.to_string()));
            }
        }

        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::NotLocked(session_id.to_string()));
        };

        if self.fingerprint.matches(data) {
            // Nothing to persist; refresh the last-touched timestamp so gc
            // sees the session as live.
            return match self.record {
                RecordState::Absent => Ok(()),
                RecordState::Present => {
                    handle.file.set_modified(SystemTime::now())?;
                    Ok(())
                }
            };
        }

        handle.file.set_len(0)?;
        handle.file.seek(SeekFrom::Start(0))?;
        handle.file.write_all(data)?;
        handle.file.flush()?;

        self.fingerprint = Fingerprint::of(data);
        self.record = RecordState::Present;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    async fn destroy(&mut self, ctx: &RequestContext, session_id: &str) -> Result<()> {
        self.ensure_open()?;
        let path = self.session_path(ctx, session_id)?;
        self.release();

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn gc(&mut self, max_lifetime_secs: i64) -> Result<u64> {
        self.ensure_open()?;

        let threshold = unix_now() - max_lifetime_secs.max(0);
        let mut removed = 0u64;

        for entry in fs::read_dir(&self.save_path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !self.matches_session_file(file_name) {
                continue;
            }

            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(mtime) = meta.modified() else {
                continue;
            };
            let mtime_epoch = mtime
                .duration_since(std::time::UNIX_EPOCH)
                .map(|age| age.as_secs() as i64)
                .unwrap_or(0);
            if mtime_epoch > threshold {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), err = %err, "gc could not remove session file");
                }
            }
        }

        tracing::debug!(removed, "session gc swept file store");
        Ok(removed)
    }
}

fn is_hex_lower(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

/// Client-address segment for session file names: 32 lowercase hex chars.
fn ip_hash(addr: &str) -> String {
    hex::encode(&blake3::hash(addr.as_bytes()).as_bytes()[..IP_HASH_LEN / 2])
}
