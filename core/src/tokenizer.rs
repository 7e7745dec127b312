use lazy_static::lazy_static;
use regex::bytes::Regex;

lazy_static! {
    // A tag runs from `<` to the next `>`, or to end of input when unterminated.
    static ref RE: Regex = Regex::new(r"(?-u)<[^>]*>?|[A-Za-z]+").expect("valid regex");
}

/// Lazily split raw document bytes into lowercase alphabetic words.
///
/// Markup (`<...>`) and every non-letter byte act as delimiters and never show up
/// in a token. The same input always yields the same sequence, so indexing and
/// querying share this one function.
pub fn tokenize<T: AsRef<[u8]> + ?Sized>(input: &T) -> impl Iterator<Item = String> + '_ {
    RE.find_iter(input.as_ref()).filter_map(|m| {
        let bytes = m.as_bytes();
        if bytes[0] == b'<' {
            return None;
        }
        Some(bytes.iter().map(|b| char::from(b.to_ascii_lowercase())).collect())
    })
}
