//! Fixed-width key and value encoding for tree nodes.
//!
//! Keys and values are stored inline in node pages as little-endian
//! fixed-width slots, so a node can address slot `i` by offset arithmetic
//! alone.

/// A fixed-width value that can be stored in a tree node.
pub trait IndexValue: Copy {
    /// Encoded width in bytes.
    const ENCODED_LEN: usize;

    /// Writes the value into the first `ENCODED_LEN` bytes of `buf`.
    fn encode_into(&self, buf: &mut [u8]);

    /// Reads a value from the first `ENCODED_LEN` bytes of `buf`.
    fn decode_from(buf: &[u8]) -> Self;
}

/// A fixed-width, totally ordered key.
///
/// The comparator must be total and deterministic; the tree keeps node keys
/// strictly increasing under it.
pub trait IndexKey: IndexValue + Ord {}

impl<T: IndexValue + Ord> IndexKey for T {}

macro_rules! impl_index_value_for_int {
    ($($t:ty),*) => {
        $(
            impl IndexValue for $t {
                const ENCODED_LEN: usize = std::mem::size_of::<$t>();

                #[inline]
                fn encode_into(&self, buf: &mut [u8]) {
                    buf[..Self::ENCODED_LEN].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode_from(buf: &[u8]) -> Self {
                    let mut bytes = [0u8; std::mem::size_of::<$t>()];
                    bytes.copy_from_slice(&buf[..Self::ENCODED_LEN]);
                    Self::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_index_value_for_int!(u16, u32, u64, i16, i32, i64);
