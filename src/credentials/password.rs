use rand::Rng;

use crate::constants::PASSWORD_LENGTH;

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random alphanumeric password of the standard length
pub fn generate_password() -> String {
    generate_password_of(PASSWORD_LENGTH)
}

/// Generate a random alphanumeric password from the thread-local CSPRNG
pub fn generate_password_of(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}
