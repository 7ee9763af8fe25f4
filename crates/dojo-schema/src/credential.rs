use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const HEX: &[u8] = b"0123456789abcdef";

pub const MIN_PASSWORD_LEN: usize = 4;
pub const MAX_PASSWORD_LEN: usize = 50;
pub const MAX_SUFFIX_LEN: usize = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("password length must be between {MIN_PASSWORD_LEN} and {MAX_PASSWORD_LEN}, got {0}")]
    PasswordLength(usize),
    #[error("suffix length must be between 1 and {MAX_SUFFIX_LEN}, got {0}")]
    SuffixLength(usize),
}

/// Time-bounded login handed to one participant.
///
/// Only ever returned to the operator; session records never contain it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Generate a password of `length` characters with at least one uppercase
/// letter, one lowercase letter and one digit.
pub fn generate_password(length: usize) -> Result<String, CredentialError> {
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&length) {
        return Err(CredentialError::PasswordLength(length));
    }
    let mut rng = rand::thread_rng();
    let all: Vec<u8> = [UPPER, LOWER, DIGITS].concat();

    let mut chars = Vec::with_capacity(length);
    for class in [UPPER, LOWER, DIGITS] {
        chars.push(class[rng.gen_range(0..class.len())]);
    }
    while chars.len() < length {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);

    Ok(chars.into_iter().map(char::from).collect())
}

/// Whether `password` contains an uppercase letter, a lowercase letter and a digit.
pub fn validate_password(password: &str) -> bool {
    password.bytes().any(|b| b.is_ascii_uppercase())
        && password.bytes().any(|b| b.is_ascii_lowercase())
        && password.bytes().any(|b| b.is_ascii_digit())
}

/// Random lowercase hex suffix, used to keep generated names unique.
pub fn generate_suffix(length: usize) -> Result<String, CredentialError> {
    if length == 0 || length > MAX_SUFFIX_LEN {
        return Err(CredentialError::SuffixLength(length));
    }
    let mut rng = rand::thread_rng();
    Ok((0..length)
        .map(|_| char::from(HEX[rng.gen_range(0..HEX.len())]))
        .collect())
}
