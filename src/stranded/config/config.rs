use std::mem::MaybeUninit;
use std::path::PathBuf;

use serde::Deserialize;

use crate::stranded::common::{Error, Result};

/// Either a filesystem path or literal bytes. Used for TLS certificate
/// chains, private keys, and for resolving relative paths against the
/// directory the config file was loaded from.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FileOrBytes {
    FilePath(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsMaterial {
    pub cert_chain: FileOrBytes,
    pub private_key: FileOrBytes,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub port: u16,
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
}

#[derive(Deserialize)]
pub struct Settings {
    /// config_path is the path of the loaded config file, filled in by `load`.
    #[serde(default)]
    config_path: PathBuf,
    /// app_name identifies this process in logs.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// host to bind listeners on, defaults to 0.0.0.0.
    #[serde(default = "default_host")]
    pub host: String,
    /// worker_count is the number of tokio worker threads the reactor runs
    /// with. Defaults to the number of logical CPUs.
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
    /// reuseport binds one listening socket per worker thread with
    /// SO_REUSEPORT instead of a single shared listener, reducing accept
    /// contention at the cost of being unable to detect "port already in
    /// use" at startup.
    #[serde(default)]
    pub reuseport: bool,
    /// recv_buffer_size is the default size for user-space read buffers
    /// (BasicProtocol's fixed buffer, ByteReceiver's initial block size).
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: u32,
    /// idle connections are closed after this many seconds of inactivity.
    /// 0 disables the sweep.
    #[serde(default)]
    pub timeout_seconds: u32,
    /// max_connections rejects new accepts past this count. 0 disables
    /// the limit.
    #[serde(default)]
    pub max_connections: u32,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

fn default_app_name() -> String {
    "stranded".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_worker_count() -> u32 {
    num_cpus::get() as u32
}
const fn default_recv_buffer_size() -> u32 {
    32 * 1024
}

static mut SETTINGS: MaybeUninit<Settings> = MaybeUninit::uninit();

/// Returns the process-wide settings loaded by `load_config`. Panics (via
/// an invalid read) if called before `load_config` - matches the teacher's
/// `config()` accessor, which is likewise only safe post-startup.
pub fn config() -> &'static Settings {
    unsafe { &*SETTINGS.as_ptr() }
}

pub(crate) unsafe fn settings_slot() -> &'static mut Settings {
    &mut *SETTINGS.as_mut_ptr()
}

impl Settings {
    pub(crate) fn finish_loading(&mut self, path: PathBuf) -> Result<()> {
        self.config_path = path;
        if self.recv_buffer_size < 4096 {
            self.recv_buffer_size = default_recv_buffer_size();
        }
        if self.recv_buffer_size > 1024 * 1024 {
            return Err(Error::new("recv_buffer_size cannot be > 1MB"));
        }
        self.recv_buffer_size = self.recv_buffer_size.next_power_of_two();
        if self.worker_count == 0 {
            self.worker_count = default_worker_count();
        }
        Ok(())
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}
