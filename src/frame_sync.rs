//! Marker scanning for the serial frame stream
//!
//! Every frame on the wire starts with the ASCII marker `VIZ`. The device
//! also prints ordinary log text on the same link, so the host cannot assume
//! the stream starts on a frame boundary and has to scan for the marker.
//!
//! All functions here are pure: they never modify the buffer they inspect.

/// Frame start marker
pub const MARKER: &[u8; 3] = b"VIZ";

/// Length of [`MARKER`] in bytes
pub const MARKER_LEN: usize = MARKER.len();

/// Locate the earliest complete marker in `data`
///
/// Returns the offset of the first byte *after* the marker, or `None` if no
/// complete marker is present. A marker cut off at the end of the buffer is
/// not reported; the caller should wait for more bytes.
#[inline]
pub fn find_marker(data: &[u8]) -> Option<usize> {
    find_marker_start(data).map(|start| start + MARKER_LEN)
}

/// Locate the earliest complete marker in `data`, returning its first byte
#[inline]
pub fn find_marker_start(data: &[u8]) -> Option<usize> {
    data.windows(MARKER_LEN).position(|window| window == MARKER)
}

/// Locate the earliest complete marker starting before `limit`
///
/// The marker itself may extend past `limit`, as long as it is buffered.
pub fn find_marker_before(data: &[u8], limit: usize) -> Option<usize> {
    let end = (limit + MARKER_LEN - 1).min(data.len());
    find_marker_start(&data[..end]).filter(|&start| start < limit)
}

/// Number of trailing bytes that must be kept while no marker is found
///
/// These are the bytes that could still turn out to be the beginning of a
/// marker once the next chunk arrives. Everything before them is noise.
pub fn retained_tail_len(data: &[u8]) -> usize {
    (1..MARKER_LEN)
        .rev()
        .find(|&n| n <= data.len() && data[data.len() - n..] == MARKER[..n])
        .unwrap_or(0)
}

/// Locate the earliest marker that is followed by the given frame geometry
///
/// The first four bytes of every record are its little-endian width and
/// height, so a marker followed by the expected geometry is a very strong
/// frame-start signal even inside arbitrary pixel data.
///
/// Only markers starting before `limit` are considered. Returns
/// `Err(NeedMoreData)` when a marker candidate before `limit` is too close to
/// the end of `data` to check its geometry yet.
pub fn find_frame_header(
    data: &[u8],
    limit: usize,
    width: u16,
    height: u16,
) -> Result<Option<usize>, NeedMoreData> {
    let mut expected = [0u8; 4];
    expected[..2].copy_from_slice(&width.to_le_bytes());
    expected[2..].copy_from_slice(&height.to_le_bytes());

    let mut search_from = 0;
    while search_from < limit.min(data.len()) {
        let Some(rel) = find_marker_start(&data[search_from..]) else {
            return Ok(None);
        };
        let start = search_from + rel;
        if start >= limit {
            return Ok(None);
        }

        let geometry = start + MARKER_LEN;
        if geometry + expected.len() > data.len() {
            return Err(NeedMoreData);
        }
        if data[geometry..geometry + expected.len()] == expected {
            return Ok(Some(start));
        }

        search_from = start + 1;
    }

    Ok(None)
}

/// Locate the start of a newer frame beginning before `limit`
///
/// With `geometry`, a marker only counts when followed by that width and
/// height (see [`find_frame_header`]); without it, any marker counts. A
/// marker prefix cut off at the end of `data` before `limit` yields
/// `Err(NeedMoreData)`.
pub fn find_frame_start(
    data: &[u8],
    limit: usize,
    geometry: Option<(u16, u16)>,
) -> Result<Option<usize>, NeedMoreData> {
    let found = match geometry {
        Some((width, height)) => find_frame_header(data, limit, width, height)?,
        None => find_marker_before(data, limit),
    };
    if found.is_some() {
        return Ok(found);
    }

    let end = (limit + MARKER_LEN - 1).min(data.len());
    let tail = retained_tail_len(&data[..end]);
    if tail > 0 && end == data.len() && end - tail < limit {
        return Err(NeedMoreData);
    }
    Ok(None)
}

/// A header candidate could not be checked with the bytes buffered so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedMoreData;
