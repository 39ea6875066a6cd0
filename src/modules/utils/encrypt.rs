use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailSiftResult;
use crate::modules::settings::cli::SETTINGS;
use crate::raise_error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Checks the configured encryption key at startup: 64 hex characters
/// decoding to exactly 32 bytes.
pub fn validate_encryption_key() -> MailSiftResult<()> {
    decode_key(&SETTINGS.mailsift_encryption_key).map(|_| ())
}

pub fn encrypt_string(plaintext: &str) -> MailSiftResult<String> {
    let key = decode_key(&SETTINGS.mailsift_encryption_key)?;
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|_| raise_error!("Invalid key or IV length".into(), ErrorCode::InternalError))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
}

pub fn decrypt_string(data: &str) -> MailSiftResult<String> {
    let key = decode_key(&SETTINGS.mailsift_encryption_key)?;
    let (iv_hex, cipher_hex) = data.split_once(':').ok_or_else(|| {
        raise_error!(
            "Encrypted value is not in iv:ciphertext form".into(),
            ErrorCode::InternalError
        )
    })?;
    let iv: [u8; IV_LEN] = hex::decode(iv_hex)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| {
            raise_error!(
                "Encrypted value carries an invalid IV".into(),
                ErrorCode::InternalError
            )
        })?;
    let ciphertext = hex::decode(cipher_hex).map_err(|_| {
        raise_error!(
            "Encrypted value carries invalid hex ciphertext".into(),
            ErrorCode::InternalError
        )
    })?;
    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|_| raise_error!("Invalid key or IV length".into(), ErrorCode::InternalError))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| {
            raise_error!(
                "Decryption failed, likely due to an incorrect encryption key or corrupted data"
                    .into(),
                ErrorCode::InternalError
            )
        })?;
    String::from_utf8(plaintext).map_err(|_| {
        raise_error!(
            "Decrypted value is not valid UTF-8".into(),
            ErrorCode::InternalError
        )
    })
}

fn decode_key(key_hex: &str) -> MailSiftResult<Vec<u8>> {
    let key = hex::decode(key_hex).map_err(|_| {
        raise_error!(
            "The encryption key must be valid hex".into(),
            ErrorCode::MissingConfiguration
        )
    })?;
    if key.len() != KEY_LEN {
        return Err(raise_error!(
            format!(
                "The encryption key must decode to {} bytes, got {}",
                KEY_LEN,
                key.len()
            ),
            ErrorCode::MissingConfiguration
        ));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn round_trip() {
        let plaintext = "imap-password-with-unicode-✓";
        let encrypted = encrypt_string(plaintext).unwrap();
        let decrypted = decrypt_string(&encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ciphertext_format() {
        let encrypted = encrypt_string("hello").unwrap();
        let re = Regex::new(r"^[0-9a-f]{32}:[0-9a-f]+$").unwrap();
        assert!(re.is_match(&encrypted), "unexpected format: {encrypted}");
    }

    #[test]
    fn distinct_ivs_per_call() {
        let a = encrypt_string("same input").unwrap();
        let b = encrypt_string("same input").unwrap();
        assert_ne!(a, b);
        assert_eq!(decrypt_string(&a).unwrap(), decrypt_string(&b).unwrap());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(decrypt_string("no-separator").is_err());
        assert!(decrypt_string("zzzz:abcd").is_err());
        assert!(decrypt_string("00112233445566778899aabbccddeeff:nothex").is_err());
    }
}
