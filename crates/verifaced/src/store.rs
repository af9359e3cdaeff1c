use std::path::Path;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;
use veriface_core::{encode_image, Account, Descriptor};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

/// Upper bound on descriptor length accepted for storage.
const MAX_DESCRIPTOR_DIM: usize = 4096;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("email already in use")]
    DuplicateEmail,
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid descriptor dimension: {0}")]
    InvalidDescriptorDim(usize),
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidDescriptorValue,
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// A registered user as stored.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub password_hash: String,
    pub face_image: Vec<u8>,
    pub descriptor: Descriptor,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    /// Public view returned to clients. Never includes the password hash.
    pub fn to_account(&self) -> Account {
        Account {
            id: self.id,
            full_name: self.full_name.clone(),
            email: self.email.clone(),
            face_image: Some(encode_image(&self.face_image)),
            created_at: self.created_at,
        }
    }
}

pub struct NewUser {
    pub full_name: String,
    pub email: String,
    pub password_hash: String,
    pub face_image: Vec<u8>,
    pub descriptor: Descriptor,
}

/// SQLite-backed user storage.
///
/// Reference descriptors are encrypted with AES-256-GCM before storage. A
/// per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct UserStore {
    conn: Connection,
    cipher: DescriptorCipher,
}

type UserRow = (String, String, String, String, Vec<u8>, Vec<u8>, String);

impl UserStore {
    /// Open (or create) the database at the given path and create the schema.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        // In-memory stores are test fixtures and never persist, so a fixed key is enough.
        let key = if db_path == Path::new(":memory:") {
            [0u8; 32]
        } else {
            let dir = match db_path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(dir).map_err(StoreError::KeyIo)?;
            installation_key(&dir.join(".key"))?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS users (
                     id TEXT PRIMARY KEY,
                     full_name TEXT NOT NULL,
                     email TEXT NOT NULL UNIQUE,
                     password_hash TEXT NOT NULL,
                     face_image BLOB NOT NULL,
                     descriptor BLOB NOT NULL,
                     created_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            cipher: DescriptorCipher::new(&key),
        })
    }

    /// Insert a new user. Emails are unique, compared case-insensitively.
    pub async fn insert(&self, user: NewUser) -> Result<UserRecord, StoreError> {
        let blob = self.cipher.seal(&user.descriptor.values)?;
        let record = UserRecord {
            id: Uuid::new_v4(),
            full_name: user.full_name,
            email: normalize_email(&user.email),
            password_hash: user.password_hash,
            face_image: user.face_image,
            descriptor: user.descriptor,
            created_at: Utc::now(),
        };

        let params = (
            record.id.to_string(),
            record.full_name.clone(),
            record.email.clone(),
            record.password_hash.clone(),
            record.face_image.clone(),
            blob,
            record.created_at.to_rfc3339(),
        );
        let inserted = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (id, full_name, email, password_hash, face_image, descriptor, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![params.0, params.1, params.2, params.3, params.4, params.5, params.6],
                )?;
                Ok(())
            })
            .await;

        match inserted {
            Ok(()) => Ok(record),
            Err(tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateEmail)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let email = normalize_email(email);

        // Fetch the raw row; decrypt outside the blocking closure.
        let row: Option<UserRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, full_name, email, password_hash, face_image, descriptor, created_at
                     FROM users WHERE email = ?1",
                )?;
                let mut rows = stmt.query_map([&email], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })?;
                Ok(rows.next().transpose()?)
            })
            .await?;

        row.map(|row| self.decode_row(row)).transpose()
    }

    /// Count registered users.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    fn decode_row(&self, row: UserRow) -> Result<UserRecord, StoreError> {
        let (id, full_name, email, password_hash, face_image, blob, created_at) = row;
        Ok(UserRecord {
            id: Uuid::parse_str(&id).map_err(|e| StoreError::CorruptRow(e.to_string()))?,
            full_name,
            email,
            password_hash,
            face_image,
            descriptor: Descriptor::new(self.cipher.open(&blob)?),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| StoreError::CorruptRow(e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// AES-256-GCM sealing of descriptor blobs: `nonce (12) || ciphertext || tag (16)`.
#[derive(Clone)]
struct DescriptorCipher {
    cipher: Aes256Gcm,
}

impl DescriptorCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    fn seal(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        validate_descriptor_values(values)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), descriptor_to_bytes(values).as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;
        Ok([nonce.as_slice(), sealed.as_slice()].concat())
    }

    fn open(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StoreError::DecryptionFailed)?;
        bytes_to_descriptor_strict(&plain)
    }
}

/// Read the installation key, creating it (mode 0600) on first use.
fn installation_key(path: &Path) -> Result<[u8; 32], StoreError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
    {
        Ok(mut file) => {
            file.write_all(&key).map_err(StoreError::KeyIo)?;
            tracing::info!(path = %path.display(), "generated descriptor encryption key");
            return Ok(key);
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(StoreError::KeyIo(e)),
    }

    let stored = std::fs::read(path).map_err(StoreError::KeyIo)?;
    let len = stored.len();
    stored.try_into().map_err(|_| {
        StoreError::KeyIo(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} holds {len} bytes, expected 32", path.display()),
        ))
    })
}

fn descriptor_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_descriptor_strict(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    validate_descriptor_values(&values)?;
    Ok(values)
}

fn validate_descriptor_values(values: &[f32]) -> Result<(), StoreError> {
    if values.is_empty() || values.len() > MAX_DESCRIPTOR_DIM {
        return Err(StoreError::InvalidDescriptorDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidDescriptorValue);
    }
    Ok(())
}
