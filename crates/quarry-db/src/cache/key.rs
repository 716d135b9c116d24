//! Cache key derivation.
//!
//! A key is `<namespace>:<table>:<digest>`, where the digest is the hex
//! SHA-256 of a framed envelope holding the statement text and its
//! JSON-encoded arguments. Equal statements always produce equal keys, and
//! every key for a table shares the `<namespace>:<table>:` prefix, which is
//! what table-wide invalidation deletes.

use quarry_mapping::Statement;
use sha2::{Digest, Sha256};

use crate::error::DbError;

const KEY_DOMAIN_TAG: &[u8] = b"quarry-cache:v1";

/// Key of the cached result of `stmt` against `table`.
///
/// # Errors
///
/// Returns [`DbError::Serialization`] if the arguments cannot be encoded.
pub fn cache_key(namespace: &str, table: &str, stmt: &Statement) -> Result<String, DbError> {
    let args = serde_json::to_vec(&stmt.args)?;

    let mut hasher = Sha256::new();
    hasher.update(KEY_DOMAIN_TAG);
    write_framed(&mut hasher, stmt.sql.as_bytes());
    write_framed(&mut hasher, &args);

    Ok(format!("{}{:x}", table_prefix(namespace, table), hasher.finalize()))
}

/// Prefix shared by every key of `table`.
pub fn table_prefix(namespace: &str, table: &str) -> String {
    format!("{}{table}:", namespace_prefix(namespace))
}

/// Prefix shared by every key in `namespace`; empty without a namespace.
pub fn namespace_prefix(namespace: &str) -> String {
    if namespace.is_empty() {
        String::new()
    } else {
        format!("{namespace}:")
    }
}

fn write_framed(hasher: &mut Sha256, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    hasher.update(len.to_be_bytes());
    hasher.update(bytes);
}
