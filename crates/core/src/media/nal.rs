//! Annex B bitstream helpers shared by the H.264 and H.265 packetizers.
//!
//! Annex B delimits NAL units with start codes:
//! - 4-byte: `0x00 0x00 0x00 0x01`
//! - 3-byte: `0x00 0x00 0x01`

/// Split an Annex B bitstream into NAL unit slices (start codes excluded).
///
/// Scans for both start code lengths and tracks each one so boundaries
/// between adjacent NALs are computed correctly when mixed 3-byte and
/// 4-byte start codes appear. Bytes before the first start code are ignored.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nal_units = Vec::with_capacity(start_entries.len());
    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = match start_entries.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };
        if start < end {
            nal_units.push(&data[start..end]);
        }
    }
    nal_units
}

/// Length of the start code at the beginning of `data`, or 0.
pub fn start_code_len(data: &[u8]) -> usize {
    if data.starts_with(&[0, 0, 0, 1]) {
        4
    } else if data.starts_with(&[0, 0, 1]) {
        3
    } else {
        0
    }
}

/// Convert a length-prefixed stream (AVCC/HVCC) to Annex B.
///
/// Tries 4-byte length fields first, then 2-byte. Returns `None` when
/// neither interpretation consumes the buffer exactly.
pub fn length_prefixed_to_annex_b(data: &[u8]) -> Option<Vec<u8>> {
    convert_length_prefixed(data, 4).or_else(|| convert_length_prefixed(data, 2))
}

fn convert_length_prefixed(data: &[u8], field: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut pos = 0usize;
    let mut count = 0usize;
    while pos < data.len() {
        if data.len() - pos < field {
            return None;
        }
        let len = data[pos..pos + field]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        pos += field;
        if len == 0 || len > data.len() - pos {
            return None;
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&data[pos..pos + len]);
        pos += len;
        count += 1;
    }
    (count > 0).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = split_annex_b(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_single_nal_3byte_sc() {
        let data = [0, 0, 1, 0x67, 0x42, 0x00];
        assert_eq!(split_annex_b(&data), vec![&[0x67, 0x42, 0x00][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = split_annex_b(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 0x42]);
        assert_eq!(nals[1], &[0x68, 0xCE]);
    }

    #[test]
    fn extract_empty_and_no_start_code() {
        assert!(split_annex_b(&[]).is_empty());
        assert!(split_annex_b(&[0xFF, 0xFE]).is_empty());
    }

    #[test]
    fn start_code_lengths() {
        assert_eq!(start_code_len(&[0, 0, 0, 1, 9]), 4);
        assert_eq!(start_code_len(&[0, 0, 1, 9]), 3);
        assert_eq!(start_code_len(&[0, 1, 9]), 0);
    }

    #[test]
    fn converts_four_byte_length_prefix() {
        let data = [0, 0, 0, 2, 0x26, 0x01, 0, 0, 0, 1, 0x02];
        let out = length_prefixed_to_annex_b(&data).unwrap();
        assert_eq!(out, vec![0, 0, 0, 1, 0x26, 0x01, 0, 0, 0, 1, 0x02]);
    }

    #[test]
    fn rejects_inconsistent_lengths() {
        assert!(length_prefixed_to_annex_b(&[0, 0, 0, 9, 1, 2]).is_none());
    }
}
