use rand::Rng;

use crate::error::{Error, Result};

/// Generates a random token of size N bytes, encoded in base58.
pub fn generate_token<const N: usize>(mut rng: impl Rng) -> Result<String> {
    let mut token = [0u8; N];
    rng.try_fill_bytes(&mut token).map_err(Error::internal)?;
    Ok(bs58::encode(token).into_string())
}

/// Generates a fresh message identifier.
pub fn generate_message_id() -> Result<String> {
    generate_token::<16>(rand::thread_rng())
}
