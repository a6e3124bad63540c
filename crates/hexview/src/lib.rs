// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Incremental hex dump formatting for wire taps, with no_std support.
#![cfg_attr(not(test), no_std)]

/// Formats a byte slice as an offset/hex/ASCII dump without allocating.
pub struct HexView<'a> {
    bytes: &'a [u8],
}

impl<'a> core::fmt::Display for HexView<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (idx, line) in self.bytes.chunks(0x10).enumerate() {
            write!(f, "{:08x}  ", idx * 0x10)?;
            for col in 0..0x10 {
                match line.get(col) {
                    Some(b) => write!(f, "{b:02x} ")?,
                    None => write!(f, "   ")?,
                }
                if col == 7 {
                    write!(f, " ")?;
                }
            }
            write!(f, " |")?;
            for &b in line {
                if b.is_ascii_graphic() || b == b' ' {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, ".")?;
                }
            }
            writeln!(f, "|")?;
        }
        Ok(())
    }
}

impl HexView<'_> {
    pub fn new(bytes: &[u8]) -> HexView {
        HexView { bytes }
    }
}

/// Returns the length of the leading run of printable text in `bytes`.
///
/// Wire taps print runs of text verbatim and only fall back to a hex dump
/// for the binary tail.
pub fn printable_prefix(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .position(|&b| !(b.is_ascii_graphic() || b.is_ascii_whitespace() || b == b' '))
        .unwrap_or(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_line() {
        let out = format!("{}", HexView::new(b"ABCDE"));
        assert_eq!(
            out,
            "00000000  41 42 43 44 45                                    |ABCDE|\n"
        );
    }

    #[test]
    fn two_lines_with_binary() {
        let mut bytes = [0u8; 18];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let out = format!("{}", HexView::new(&bytes));
        assert_eq!(
            out,
            "00000000  00 01 02 03 04 05 06 07  08 09 0a 0b 0c 0d 0e 0f  |................|\n\
             00000010  10 11                                             |..|\n"
        );
    }

    #[test]
    fn printable_prefix_finds_binary_tail() {
        assert_eq!(printable_prefix(b"HTTP/1.1 200\r\n\r\n\x05\x00"), 16);
        assert_eq!(printable_prefix(b"all text"), 8);
        assert_eq!(printable_prefix(b"\x00"), 0);
    }
}
