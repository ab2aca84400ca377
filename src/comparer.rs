//! Key ordering as a capability set.
//!
//! The core never hardcodes an ordering; it holds a [`Comparer`] reference
//! supplied at construction. Besides the total order itself, the table
//! writer uses the two key-shortening hooks to build small index separators.

use std::cmp::Ordering;

/// Total order over byte sequences, plus the shortening hooks used when
/// building index blocks. Implementations must be consistent: `separator`
/// and `successor` may only return keys that preserve the order they are
/// documented to preserve.
pub trait Comparer: Send + Sync {
    /// The name persisted alongside files sorted by this comparer. A reader
    /// configured with a differently-named comparer must refuse the file.
    fn name(&self) -> &'static str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Returns a key `k` with `a <= k < b`, shorter than `a` if possible.
    /// Returning `None` means "use `a` unchanged".
    fn separator(&self, a: &[u8], b: &[u8]) -> Option<Vec<u8>>;

    /// Returns a key `k >= key`, shorter than `key` if possible. Returning
    /// `None` means "use `key` unchanged".
    fn successor(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// The user-key portion of `key`. Identity for plain comparers;
    /// wrapping comparers strip their trailer.
    fn user_key<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        key
    }

    /// Orders two keys by their user-key portions only.
    fn user_compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.compare(a, b)
    }
}

/// Lexicographic byte-wise ordering. The default comparer.
pub struct BytewiseComparer;

impl Comparer for BytewiseComparer {
    fn name(&self) -> &'static str {
        "leveldb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn separator(&self, a: &[u8], b: &[u8]) -> Option<Vec<u8>> {
        let n = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
        // One key is a prefix of the other, no shorter separator exists.
        if n >= a.len() || n >= b.len() {
            return None;
        }
        let c = a[n];
        if c < 0xff && c + 1 < b[n] {
            let mut sep = a[..=n].to_vec();
            sep[n] += 1;
            return Some(sep);
        }
        None
    }

    fn successor(&self, key: &[u8]) -> Option<Vec<u8>> {
        for (i, &c) in key.iter().enumerate() {
            if c != 0xff {
                let mut succ = key[..=i].to_vec();
                succ[i] += 1;
                return Some(succ);
            }
        }
        // Run of 0xff bytes, key is its own successor.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare() {
        let cmp = BytewiseComparer;
        assert_eq!(cmp.compare(b"abc", b"abd"), Ordering::Less);
        assert_eq!(cmp.compare(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(cmp.compare(b"abcd", b"abc"), Ordering::Greater);
    }

    #[test]
    fn test_separator_shortens() {
        let cmp = BytewiseComparer;
        let sep = cmp.separator(b"apple", b"banana").expect("separator");
        assert_eq!(sep, b"b".to_vec());
        assert!(cmp.compare(b"apple", &sep) != Ordering::Greater);
        assert_eq!(cmp.compare(&sep, b"banana"), Ordering::Less);
    }

    #[test]
    fn test_separator_prefix_keys() {
        let cmp = BytewiseComparer;
        // "app" is a prefix of "apple"; no shorter separator exists.
        assert_eq!(cmp.separator(b"app", b"apple"), None);
        // Adjacent bytes leave no room in between.
        assert_eq!(cmp.separator(b"abc", b"abd"), None);
    }

    #[test]
    fn test_successor() {
        let cmp = BytewiseComparer;
        assert_eq!(cmp.successor(b"apple").expect("successor"), b"b".to_vec());
        assert_eq!(
            cmp.successor(b"\xff\xffa").expect("successor"),
            b"\xff\xffb".to_vec()
        );
        assert_eq!(cmp.successor(b"\xff\xff"), None);
    }
}
