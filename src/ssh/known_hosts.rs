//! Known-hosts storage and host key verification
//!
//! Parses the OpenSSH `known_hosts` format (`host keytype base64-key`),
//! verifies presented server keys against it, and appends new entries on
//! trust-on-first-use. Stores are instance-scoped: each transport connect
//! opens the store for the identity's configured path.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Outcome of checking a presented host key.
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyCheck {
    /// The key matches a recorded entry.
    Verified,
    /// The host has no recorded key of this type.
    Unknown { fingerprint: String },
    /// The host has a recorded key of this type and it differs.
    Mismatch {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// One known_hosts file, cached in memory.
pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Open the store at `path`, or at `~/.ssh/known_hosts` when `None`.
    /// A missing file is treated as empty.
    pub fn open(path: Option<PathBuf>) -> Self {
        let path = path.unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".ssh").join("known_hosts"))
                .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
        });

        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };
        if let Err(e) = store.load() {
            warn!("failed to load known_hosts {}: {}", store.path.display(), e);
        }
        store
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias...] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }
            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) are not matchable here.
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
            }
        }

        debug!(
            "loaded {} known host entries from {}",
            hosts.len(),
            self.path.display()
        );
        Ok(())
    }

    /// SHA256 fingerprint in the OpenSSH `SHA256:...` rendering.
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_bytes(&key.public_key_bytes())
    }

    /// Check `key` against the recorded entries for `host:port`.
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyCheck {
        let lookup = lookup_key(host, port);
        let actual_b64 = BASE64.encode(key.public_key_bytes());
        let actual_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();

        let check_entries = |entries: &Vec<HostKeyEntry>| -> Option<HostKeyCheck> {
            for entry in entries {
                if entry.key_type == actual_type {
                    if entry.key_data == actual_b64 {
                        return Some(HostKeyCheck::Verified);
                    }
                    let expected = BASE64
                        .decode(&entry.key_data)
                        .map(|b| fingerprint_bytes(&b))
                        .unwrap_or_else(|_| "unparseable".to_string());
                    return Some(HostKeyCheck::Mismatch {
                        expected_fingerprint: expected,
                        actual_fingerprint: fingerprint.clone(),
                    });
                }
            }
            // Host known, but not for this key type.
            None
        };

        // Exact [host]:port entry first, bare hostname second.
        for candidate in [lookup, host.to_lowercase()] {
            if let Some(entries) = hosts.get(&candidate) {
                if let Some(result) = check_entries(entries) {
                    return result;
                }
            }
        }

        HostKeyCheck::Unknown { fingerprint }
    }

    /// Record `key` for `host:port` in memory and append it to the file
    /// (trust-on-first-use).
    pub fn record(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup = lookup_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        {
            let mut hosts = self.hosts.write();
            hosts.entry(lookup.clone()).or_default().push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64.clone(),
            });
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup, key_type, key_b64)?;

        info!("recorded host key for {} ({})", lookup, key_type);
        Ok(())
    }
}

/// `[host]:port` for non-default ports, bare lowercase host otherwise.
fn lookup_key(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Strip `[host]:port` bracketing for map lookups.
fn normalize_hostname(host: &str) -> String {
    let host = host.trim_start_matches('[');
    if let Some(idx) = host.find("]:") {
        // Keep the port-qualified form so [h]:2222 and h stay distinct.
        format!("[{}]:{}", &host[..idx].to_lowercase(), &host[idx + 2..])
    } else {
        host.trim_end_matches(']').to_lowercase()
    }
}

fn fingerprint_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}
