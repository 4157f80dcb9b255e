//! Framing for the FTP control channel.
//!
//! The routing node does not interpret commands; parsing happens on the
//! processing node. The decoder therefore yields raw CRLF-framed lines and
//! the encoder writes [`Reply`] values.

use super::reply::Reply;
use crate::proto::ProtoError;
use bytes::BytesMut;
use std::io::Write;
use tokio_util::codec::{Decoder, Encoder};

// FtpCodec implements tokio's `Decoder` and `Encoder` traits for the
// control channel: command lines in, replies out.
pub(crate) struct FtpCodec {
    // Stored index of the next index to examine for a '\n' character, so
    // partial reads are not rescanned from the start.
    next_index: usize,
}

impl FtpCodec {
    pub(crate) fn new() -> Self {
        FtpCodec { next_index: 0 }
    }
}

impl Default for FtpCodec {
    fn default() -> Self {
        FtpCodec::new()
    }
}

impl Decoder for FtpCodec {
    type Item = String;
    type Error = ProtoError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') {
            let newline_index = offset + self.next_index;
            let line = buf.split_to(newline_index + 1);
            self.next_index = 0;
            let text = String::from_utf8_lossy(&line);
            Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
        } else {
            self.next_index = buf.len();
            Ok(None)
        }
    }
}

impl Encoder<Reply> for FtpCodec {
    type Error = ProtoError;

    fn encode(&mut self, reply: Reply, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let mut buffer = vec![];
        match reply {
            Reply::None => {
                return Ok(());
            }
            Reply::CodeAndMsg { code, msg } => {
                if msg.is_empty() {
                    write!(buffer, "{code}\r\n")?;
                } else {
                    write!(buffer, "{code} {msg}\r\n")?;
                }
            }
            Reply::MultiLine { code, mut lines } => {
                let last_line = lines.pop().unwrap_or_default();
                if lines.is_empty() {
                    write!(buffer, "{code} {last_line}\r\n")?;
                } else {
                    // Continuation lines starting with a digit are indented
                    // so clients cannot mistake them for the final line.
                    for line in lines.iter_mut() {
                        if line.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                            line.insert(0, ' ');
                        }
                    }
                    write!(buffer, "{code}-{}\r\n{code} {last_line}\r\n", lines.join("\r\n"))?;
                }
            }
        }
        buf.extend(&buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::reply::ReplyCode;
    use pretty_assertions::assert_eq;

    fn encode(reply: Reply) -> String {
        let mut codec = FtpCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(reply, &mut buf).unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn encode_single_line() {
        assert_eq!(encode(Reply::new(ReplyCode::ServiceReady, "Service ready")), "220 Service ready\r\n");
        assert_eq!(encode(Reply::raw(226, "Done".into())), "226 Done\r\n");
        assert_eq!(encode(Reply::none()), "");
    }

    #[test]
    fn encode_multiline_indents_digit_lines() {
        let reply = Reply::new_multiline(ReplyCode::SystemStatus, vec!["status", "211 fake", "end"]);
        assert_eq!(encode(reply), "211-status\r\n 211 fake\r\n211 end\r\n");
    }

    #[test]
    fn decode_strips_crlf() {
        let mut codec = FtpCodec::new();
        let mut buf = BytesMut::from(&b"USER alice\r\nPASS secret\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "USER alice");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "PASS secret");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_waits_for_full_line() {
        let mut codec = FtpCodec::new();
        let mut buf = BytesMut::from(&b"LIS"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"T\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "LIST");
    }
}
