//! Minimal SDP text patching.
//!
//! Only what the offer rewrite needs: locating the audio media section and
//! setting its `b=AS` line. Everything else passes through untouched.

/// Session description as exchanged with the peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Sets the application-specific bandwidth of the first audio section to
/// `kbps`, replacing an existing `b=AS` line or inserting one after the
/// section's `c=` line (or directly after `m=` when there is none).
///
/// Returns `None` when the SDP has no audio section.
pub fn set_audio_bandwidth(sdp: &str, kbps: u32) -> Option<String> {
    let line_ending = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let mut lines: Vec<String> = sdp.lines().map(str::to_string).collect();
    let trailing = sdp.ends_with('\n');

    let start = lines.iter().position(|l| l.starts_with("m=audio"))?;
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());

    let bandwidth = format!("b=AS:{}", kbps);
    if let Some(existing) = (start + 1..end).find(|&i| lines[i].starts_with("b=AS:")) {
        lines[existing] = bandwidth;
    } else {
        let anchor = (start + 1..end)
            .find(|&i| lines[i].starts_with("c="))
            .unwrap_or(start);
        lines.insert(anchor + 1, bandwidth);
    }

    let mut out = lines.join(line_ending);
    if trailing {
        out.push_str(line_ending);
    }
    Some(out)
}
