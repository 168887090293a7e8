//! Nickname validation.

/// Maximum nickname length accepted by the network.
pub const MAX_NICK_LEN: usize = 9;

/// Characters beyond letters that may appear anywhere in a nickname.
#[inline]
fn is_special(c: char) -> bool {
    matches!(c, '[' | ']' | '\\' | '`' | '^' | '_' | '{' | '|' | '}')
}

/// Extension trait for checking whether a string is a valid nickname.
pub trait NickExt {
    /// Check validity against the network nick rules: the first character is
    /// a letter or one of `` []\`^_{|} ``, the remaining characters may also
    /// be digits or `-`, and the total length is 1 to [`MAX_NICK_LEN`].
    fn is_valid_nick(&self) -> bool;
}

impl NickExt for &str {
    fn is_valid_nick(&self) -> bool {
        if self.is_empty() || self.len() > MAX_NICK_LEN {
            return false;
        }
        let mut chars = self.chars();
        let first = match chars.next() {
            Some(c) => c,
            None => return false,
        };
        if !first.is_ascii_alphabetic() && !is_special(first) {
            return false;
        }
        chars.all(|c| c.is_ascii_alphanumeric() || is_special(c) || c == '-')
    }
}

impl NickExt for String {
    fn is_valid_nick(&self) -> bool {
        self.as_str().is_valid_nick()
    }
}
