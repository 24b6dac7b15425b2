//! On-disk blob store for message bodies, laid out inside the notmuch
//! database directory.
//!
//! One regular file per message, under a two-level shard farm:
//! `<root>/gotmuch/<a-p>/<a-p>/gotmuch-1-<scope>-<perm-id>`. Presence of the
//! file is the authoritative "body already downloaded" signal, so the layout
//! must stay bit-identical across runs and across versions: the shard hash,
//! the shard alphabet, and the basename escaping are all part of the on-disk
//! format.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::message::MessageBody;

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Basename format marker and encoding version.
const BASENAME_PREFIX: &str = "gotmuch-1-";

/// Sixteen shard directory names, indexed by hash nibble.
const SHARD_ALPHABET: &str = "abcdefghijklmnop";

pub struct BlobStore {
    /// The subtree this tool owns within the local store root.
    root: PathBuf,

    /// Account identifier under which perm ids are unique and permanent.
    /// Part of every basename so multi-account stores stay disjoint.
    scope: String,
}

impl BlobStore {
    /// Probe `store_root`, claim the `gotmuch/` subtree underneath it, and
    /// create the shard directory farm.
    pub fn new(store_root: &Path, scope: &str) -> Result<Self> {
        let root = store_root.join("gotmuch");
        mkdir_farm(&root).with_context(|| {
            format!("Failed to create blob directories under {}", root.display())
        })?;
        Ok(Self {
            root,
            scope: scope.to_string(),
        })
    }

    /// Whether a body for `perm_id` is already on disk.
    pub fn has(&self, perm_id: &str) -> bool {
        self.path_for(perm_id).exists()
    }

    /// Write a message body to its computed path. CRLF line endings are
    /// folded to LF first, as mandated by the wire format of the remote.
    ///
    /// No fsync: the metadata store is the durable source of truth, and a
    /// lost file only causes a re-download.
    pub fn insert(&self, msg: &MessageBody) -> Result<()> {
        if msg.header.id.perm_id.is_empty() {
            bail!("message has no id");
        }
        if msg.raw.is_empty() {
            bail!("message has no content");
        }

        let path = self.path_for(&msg.header.id.perm_id);
        let raw = fold_crlf(&msg.raw);

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(FILE_MODE);
        }
        let mut file = options
            .open(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        file.write_all(&raw)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// The deterministic path for `perm_id` under this store's scope.
    pub fn path_for(&self, perm_id: &str) -> PathBuf {
        let (first, second) = shard_dirs(perm_id);
        self.root
            .join(first)
            .join(second)
            .join(encode_basename(&self.scope, perm_id))
    }
}

/// Ask notmuch for its database path; used when the store root is not
/// configured explicitly.
pub fn notmuch_database_path() -> Result<PathBuf> {
    let output = Command::new("notmuch")
        .args(["config", "get", "database.path"])
        .output()
        .context("Failed to run notmuch config")?;
    if !output.status.success() {
        bail!("notmuch config get database.path exited with {}", output.status);
    }
    let path = String::from_utf8(output.stdout)
        .context("notmuch config output is not UTF-8")?
        .trim()
        .to_string();
    if path.is_empty() {
        bail!("notmuch config get database.path returned nothing");
    }
    Ok(PathBuf::from(path))
}

/// 32-bit FNV-1a. Part of the on-disk format; do not substitute.
fn fingerprint(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// The two shard directory names for a perm id: low nibble of the
/// fingerprint, then the next nibble up.
fn shard_dirs(perm_id: &str) -> (&'static str, &'static str) {
    let fp = fingerprint(perm_id.as_bytes());
    let nibble1 = (fp & 0xf) as usize;
    let nibble2 = ((fp >> 4) & 0xf) as usize;
    (
        &SHARD_ALPHABET[nibble1..nibble1 + 1],
        &SHARD_ALPHABET[nibble2..nibble2 + 1],
    )
}

/// Escape every byte outside `[A-Za-z0-9]` as `=HH` (uppercase hex), per the
/// portable filename character set. Alphanumerics pass through.
fn escape(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() {
            out.push(b as char);
        } else {
            out.push('=');
            out.push(HEX[usize::from(b >> 4)] as char);
            out.push(HEX[usize::from(b & 0xf)] as char);
        }
    }
    out
}

/// The filename-safe basename for `(scope, perm_id)`.
fn encode_basename(scope: &str, perm_id: &str) -> String {
    format!("{BASENAME_PREFIX}{}-{}", escape(scope), escape(perm_id))
}

/// Replace every CRLF with LF. Lone CR bytes pass through untouched.
fn fold_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
            out.push(b'\n');
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

fn mkdir(dir: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    match builder.create(dir) {
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

/// Create `root` and its 16x16 shard directories.
fn mkdir_farm(root: &Path) -> std::io::Result<()> {
    mkdir(root)?;
    for a in SHARD_ALPHABET.chars() {
        let first = root.join(a.to_string());
        mkdir(&first)?;
        for b in SHARD_ALPHABET.chars() {
            mkdir(&first.join(b.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageHeader, MessageId};
    use tempfile::tempdir;

    fn body(perm_id: &str, raw: &[u8]) -> MessageBody {
        MessageBody {
            header: MessageHeader {
                id: MessageId::new(perm_id, "t1"),
                label_ids: vec![],
                size_estimate: raw.len() as i64,
                history_id: 1,
            },
            raw: raw.to_vec(),
        }
    }

    #[test]
    fn test_fingerprint_known_vectors() {
        // Standard FNV-1a-32 test vectors.
        assert_eq!(fingerprint(b""), 0x811c9dc5);
        assert_eq!(fingerprint(b"a"), 0xe40c292c);
        assert_eq!(fingerprint(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("scope"), "scope");
        assert_eq!(escape("a9Z"), "a9Z");
        assert_eq!(escape("a.b"), "a=2Eb");
        assert_eq!(escape("竹"), "=E7=AB=B9");
        assert_eq!(escape("\n\t\x07"), "=0A=09=07");
    }

    #[test]
    fn test_encode_basename() {
        assert_eq!(encode_basename("scope", "permId"), "gotmuch-1-scope-permId");
        assert_eq!(
            encode_basename("竹", "\n\t\x07"),
            "gotmuch-1-=E7=AB=B9-=0A=09=07"
        );
    }

    #[test]
    fn test_fold_crlf() {
        assert_eq!(fold_crlf(b"a\r\nb\r\n"), b"a\nb\n");
        assert_eq!(fold_crlf(b"a\rb"), b"a\rb");
        assert_eq!(fold_crlf(b"a\nb"), b"a\nb");
        assert_eq!(fold_crlf(b"\r\n\r\n"), b"\n\n");
        assert_eq!(fold_crlf(b"a\r"), b"a\r");
    }

    #[test]
    fn test_new_creates_directory_farm() {
        let tmp = tempdir().unwrap();
        BlobStore::new(tmp.path(), "me@example.com").unwrap();

        for a in SHARD_ALPHABET.chars() {
            for b in SHARD_ALPHABET.chars() {
                let dir = tmp
                    .path()
                    .join("gotmuch")
                    .join(a.to_string())
                    .join(b.to_string());
                assert!(dir.is_dir(), "{} missing", dir.display());
            }
        }

        // Idempotent over an existing farm.
        BlobStore::new(tmp.path(), "me@example.com").unwrap();
    }

    #[test]
    fn test_path_is_deterministic() {
        let tmp = tempdir().unwrap();
        let store1 = BlobStore::new(tmp.path(), "me@example.com").unwrap();
        let store2 = BlobStore::new(tmp.path(), "me@example.com").unwrap();

        let path = store1.path_for("msg-123");
        assert_eq!(path, store2.path_for("msg-123"));
        assert!(path.starts_with(tmp.path().join("gotmuch")));

        let relative = path.strip_prefix(tmp.path().join("gotmuch")).unwrap();
        let parts: Vec<_> = relative.iter().collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 1);
        assert_eq!(parts[1].len(), 1);
        assert_eq!(
            parts[2].to_str().unwrap(),
            "gotmuch-1-me=40example=2Ecom-msg=2D123"
        );
    }

    #[test]
    fn test_insert_and_has() {
        let tmp = tempdir().unwrap();
        let store = BlobStore::new(tmp.path(), "me@example.com").unwrap();

        assert!(!store.has("m1"));
        store.insert(&body("m1", b"Subject: hi\r\n\r\nhello\r\n")).unwrap();
        assert!(store.has("m1"));

        let written = fs::read(store.path_for("m1")).unwrap();
        assert_eq!(written, b"Subject: hi\n\nhello\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(store.path_for("m1")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_insert_overwrites_in_place() {
        let tmp = tempdir().unwrap();
        let store = BlobStore::new(tmp.path(), "me@example.com").unwrap();

        store.insert(&body("m1", b"first")).unwrap();
        store.insert(&body("m1", b"second")).unwrap();
        assert_eq!(fs::read(store.path_for("m1")).unwrap(), b"second");
    }

    #[test]
    fn test_insert_rejects_empty() {
        let tmp = tempdir().unwrap();
        let store = BlobStore::new(tmp.path(), "me@example.com").unwrap();

        assert!(store.insert(&body("", b"content")).is_err());
        assert!(store.insert(&body("m1", b"")).is_err());
    }

    #[test]
    fn test_scopes_do_not_collide() {
        let tmp = tempdir().unwrap();
        let a = BlobStore::new(tmp.path(), "a@example.com").unwrap();
        let b = BlobStore::new(tmp.path(), "b@example.com").unwrap();

        a.insert(&body("m1", b"for a")).unwrap();
        assert!(a.has("m1"));
        assert!(!b.has("m1"));
    }
}
