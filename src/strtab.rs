//! Suffix-sharing string table packer.
//!
//! Ported from `StrtabSection.build()`: strings are keyed by their reversal
//! so that binary search over the reversed keys finds suffix/prefix sharing
//! opportunities. Every group shares a single physical copy — the longest
//! member — of which every other member is a suffix.

use std::collections::HashMap;

/// Build a suffix-packed string table from `strings`, given in registration
/// order. Returns the packed buffer (leading NUL, then each group's longest
/// member NUL-terminated) and a map from every registered non-empty string
/// to its offset within the buffer. The empty string always maps to offset 0.
pub fn build(strings: &[String]) -> (Vec<u8>, HashMap<String, u32>) {
    // `d` holds (reversed-key, group members sorted by ascending length),
    // kept sorted by reversed-key, mirroring the source's `bisect`-maintained list.
    let mut d: Vec<(String, Vec<String>)> = Vec::new();

    for s in strings {
        if s.is_empty() {
            continue;
        }
        let rev_s: String = s.chars().rev().collect();
        let i = d.partition_point(|(key, _)| key.as_str() < rev_s.as_str());

        if i < d.len() && d[i].0.starts_with(rev_s.as_str()) {
            insert_sorted_by_len(&mut d[i].1, s.clone());
            continue;
        }
        if i > 0 && rev_s.starts_with(d[i - 1].0.as_str()) {
            insert_sorted_by_len(&mut d[i - 1].1, s.clone());
            d[i - 1].0 = rev_s;
            continue;
        }
        d.insert(i, (rev_s, vec![s.clone()]));
    }

    let mut data = vec![0u8];
    let mut offsets = HashMap::new();
    offsets.insert(String::new(), 0u32);

    for (_, group) in &d {
        let representative = group.last().expect("group is never empty");
        data.extend_from_slice(representative.as_bytes());
        for member in group {
            let offset = (data.len() - member.len()) as u32;
            offsets.insert(member.clone(), offset);
        }
        data.push(0);
    }

    (data, offsets)
}

/// Insert `s` into `group`, which is kept sorted by ascending length
/// (`bisect.insort_right(value, s, key=len)`).
fn insert_sorted_by_len(group: &mut Vec<String>, s: String) {
    let i = group.partition_point(|existing| existing.len() <= s.len());
    group.insert(i, s);
}

/// Look up the NUL-terminated string starting at `offset` in `buffer`
pub fn lookup(buffer: &[u8], offset: u32) -> crate::error::Result<String> {
    let start = offset as usize;
    let end = buffer[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or(crate::error::Error::UnterminatedString {
            section: String::new(),
            offset,
        })?;
    Ok(String::from_utf8_lossy(&buffer[start..end]).into_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    fn owned(strings: &[&str]) -> Vec<String> {
        strings.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn every_string_looks_up_to_itself() {
        let strings = owned(&[
            "foo", "bar", "foobar", "barfoo", "oo", "o", "", "a", "ab", "bab",
        ]);
        let (buf, offsets) = build(&strings);
        for s in &strings {
            let off = offsets[s];
            assert_eq!(lookup(&buf, off).unwrap(), *s);
            assert_eq!(&buf[off as usize..off as usize + s.len()], s.as_bytes());
            assert_eq!(buf[off as usize + s.len()], 0);
        }
    }

    #[test]
    fn sharing_never_grows_the_buffer_beyond_sum_plus_one() {
        let strings = owned(&[".text", ".data", ".bss", ".ARM.attributes", ".debug_info"]);
        let (buf, _) = build(&strings);
        let sum: usize = strings.iter().map(|s| s.len()).sum();
        assert!(buf.len() <= 1 + sum);
    }

    #[test]
    fn suffix_sharing_actually_shares_bytes() {
        // "bar" is a suffix of "foobar"; a naive packer would need 3 + 6 + 2
        // NULs = 11 bytes plus the leading NUL. The shared packer reuses the
        // "bar" tail of "foobar" for the "bar" entry.
        let strings = owned(&["foobar", "bar"]);
        let (buf, offsets) = build(&strings);
        assert_eq!(buf.len(), 1 + "foobar".len() + 1);
        assert_eq!(offsets["bar"], offsets["foobar"] + 3);
    }

    #[test]
    fn empty_string_maps_to_leading_nul() {
        let strings = owned(&["", "x"]);
        let (buf, offsets) = build(&strings);
        assert_eq!(offsets[""], 0);
        assert_eq!(buf[0], 0);
    }
}
