use std::io;

use ring::digest::{Context, SHA256};
use zeroize::Zeroizing;

/// Hardware or software responder mixed into the final key.
///
/// The responder is handed the master seed from the database header at
/// key-finalisation time and returns up to 32 bytes of response material.
pub trait ChallengeResponse {
    fn challenge(&self, master_seed: &[u8]) -> io::Result<Vec<u8>>;
}

/// Composite key protecting the password database
///
/// This key is composed of a password, a key file and/or a
/// challenge-response handler which must be provided when opening a
/// KeePass password database
/// ```
/// use kdbx3::Key;
/// let mut key = Key::new();
/// key.set_user_password("secret");
/// ```
pub struct Key {
    user_password: Option<Zeroizing<Vec<u8>>>,
    keyfile: Option<Zeroizing<Vec<u8>>>,
    challenge_response: Option<Box<dyn ChallengeResponse>>,
}

impl Key {
    /// Create a new composite key
    /// ```
    /// # use kdbx3::Key;
    /// let mut key = Key::new();
    /// ```
    pub fn new() -> Key {
        Key {
            user_password: None,
            keyfile: None,
            challenge_response: None,
        }
    }

    /// Set the password for the composite key
    /// ```
    /// # use kdbx3::Key;
    /// # let mut key = Key::new();
    /// key.set_user_password("secret");
    /// ```
    pub fn set_user_password<T>(&mut self, user_password: T)
    where
        T: AsRef<[u8]>,
    {
        let mut context = Context::new(&SHA256);
        context.update(user_password.as_ref());
        self.user_password = Some(Zeroizing::new(context.finish().as_ref().to_owned()));
    }

    /// Load a key file for the composite key
    ///
    /// A 32-byte file is used verbatim, a 64-character hex file is
    /// decoded, and anything else contributes the SHA-256 of its contents.
    /// ```
    /// # use kdbx3::Key;
    /// # let mut key = Key::new();
    /// key.set_keyfile(b"not a real key file");
    /// ```
    pub fn set_keyfile<T>(&mut self, keyfile: T)
    where
        T: AsRef<[u8]>,
    {
        let contents = keyfile.as_ref();
        let contribution = if contents.len() == 32 {
            contents.to_owned()
        } else if let Some(raw) = decode_hex_keyfile(contents) {
            raw
        } else {
            let mut context = Context::new(&SHA256);
            context.update(contents);
            context.finish().as_ref().to_owned()
        };
        self.keyfile = Some(Zeroizing::new(contribution));
    }

    /// Attach a challenge-response handler queried against the master seed
    pub fn set_challenge_response(&mut self, handler: Box<dyn ChallengeResponse>) {
        self.challenge_response = Some(handler);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.user_password.is_none() && self.keyfile.is_none() && self.challenge_response.is_none()
    }

    pub(crate) fn composite_key(&self) -> Zeroizing<Vec<u8>> {
        let mut context = Context::new(&SHA256);

        if let Some(key) = &self.user_password {
            context.update(key);
        }

        if let Some(key) = &self.keyfile {
            context.update(key);
        }

        Zeroizing::new(context.finish().as_ref().to_owned())
    }

    pub(crate) fn challenge_master_seed(&self, master_seed: &[u8]) -> io::Result<Vec<u8>> {
        match &self.challenge_response {
            Some(handler) => handler.challenge(master_seed),
            None => Ok(Vec::new()),
        }
    }
}

impl Default for Key {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_hex_keyfile(contents: &[u8]) -> Option<Vec<u8>> {
    if contents.len() != 64 {
        return None;
    }
    hex::decode(contents).ok()
}

#[cfg(test)]
mod tests {
    use hex::FromHex;

    use super::*;

    // Simple password is asdf
    const PASSWORD_SIMPLE: &str = "61736466";

    // Composite key generated from simple, password-only lock
    const COMPOSITE_KEY_PASSWORD: &str =
        "fe9a32f5b565da46af951e4aab23c24b8c1565eb0b6603a03118b7d225a21e8c";

    #[test]
    fn test_user_password() {
        let data = Vec::from_hex(PASSWORD_SIMPLE).unwrap();
        let mut key = Key::new();
        key.set_user_password(data);
        assert_eq!(
            key.composite_key().to_vec(),
            Vec::from_hex(COMPOSITE_KEY_PASSWORD).unwrap()
        );
    }

    #[test]
    fn test_raw_keyfile_used_verbatim() {
        let raw = [0x42u8; 32];
        let mut key = Key::new();
        key.set_keyfile(raw);

        let mut context = Context::new(&SHA256);
        context.update(&raw);
        let expected = context.finish().as_ref().to_owned();
        assert_eq!(key.composite_key().to_vec(), expected);
    }

    #[test]
    fn test_hex_keyfile_decoded() {
        let raw = [0xA5u8; 32];
        let mut hex_key = Key::new();
        hex_key.set_keyfile(hex::encode(raw));
        let mut raw_key = Key::new();
        raw_key.set_keyfile(raw);
        assert_eq!(
            hex_key.composite_key().to_vec(),
            raw_key.composite_key().to_vec()
        );
    }

    #[test]
    fn test_empty_key() {
        let key = Key::new();
        assert!(key.is_empty());
    }

    struct FixedResponse;

    impl ChallengeResponse for FixedResponse {
        fn challenge(&self, master_seed: &[u8]) -> io::Result<Vec<u8>> {
            Ok(master_seed.iter().map(|b| b ^ 0xFF).collect())
        }
    }

    #[test]
    fn test_challenge_response() {
        let mut key = Key::new();
        key.set_challenge_response(Box::new(FixedResponse));
        let response = key.challenge_master_seed(&[0x0F; 4]).unwrap();
        assert_eq!(response, vec![0xF0; 4]);
    }
}
