// Wire protocol: length-prefixed UTF-8 messages carrying `\n`-separated fields.
//
// Frame:  int32 length (little-endian) | payload (length bytes)
// Payload ending in '\n' carries several fields, empty fields dropped.
// Payload without a trailing '\n' is one opaque field.

use crate::error::{BridgeError, Result};
use crate::layer::{CropRect, InputMode};
use crate::shm::TransferUnit;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1MB safety limit

/// Size of the acknowledgment the client sends after consuming a reply.
pub const ACK_SIZE: usize = 4;

const FIELD_SEPARATOR: char = '\n';
const COMMAND_PREFIX: &str = "gmic_qt_";

/// Encode several fields, each terminated by the separator.
pub fn encode_fields<S: AsRef<str>>(fields: &[S]) -> Vec<u8> {
    let mut payload = String::new();
    for field in fields {
        payload.push_str(field.as_ref());
        payload.push(FIELD_SEPARATOR);
    }
    payload.into_bytes()
}

/// Encode one opaque field.
pub fn encode_single(field: &str) -> Vec<u8> {
    field.as_bytes().to_vec()
}

/// Split a payload back into its fields.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| BridgeError::protocol(format!("payload is not UTF-8: {}", e)))?;

    if text.is_empty() {
        return Ok(Vec::new());
    }

    if text.ends_with(FIELD_SEPARATOR) {
        Ok(text
            .split(FIELD_SEPARATOR)
            .filter(|field| !field.is_empty())
            .map(str::to_string)
            .collect())
    } else {
        Ok(vec![text.to_string()])
    }
}

/// Read one length-prefixed payload.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = i32::from_le_bytes(len_buf);

    let len = usize::try_from(len)
        .map_err(|_| BridgeError::protocol(format!("negative message length {}", len)))?;
    if len > MAX_MESSAGE_SIZE {
        return Err(BridgeError::protocol(format!(
            "message too large: {} bytes",
            len
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one length-prefixed payload.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = i32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            BridgeError::protocol(format!("reply too large: {} bytes", payload.len()))
        })?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Block until the client confirms it consumed the reply.
pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut ack = [0u8; ACK_SIZE];
    reader.read_exact(&mut ack).await?;
    Ok(())
}

/// How the embedding application should apply output images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    InPlace,
    NewLayers,
    NewActiveLayers,
    NewImage,
}

impl OutputMode {
    /// Decode a wire value. Unknown values fall back to `InPlace`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::InPlace,
            1 => Self::NewLayers,
            2 => Self::NewActiveLayers,
            3 => Self::NewImage,
            other => {
                debug!("[PIPE] Unknown output mode {}, using InPlace", other);
                Self::InPlace
            }
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::InPlace => 0,
            Self::NewLayers => 1,
            Self::NewActiveLayers => 2,
            Self::NewImage => 3,
        }
    }
}

/// A decoded request from the external process.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetMaxLayerSize {
        mode: InputMode,
    },
    GetCroppedImages {
        mode: InputMode,
        crop: CropRect,
    },
    OutputImages {
        mode: OutputMode,
        images: Vec<TransferUnit>,
    },
    ReleaseSharedMemory,
    SetGmicCommandName {
        name: String,
    },
}

/// Accepted field count, command name included.
#[derive(Debug, Clone, Copy)]
enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }
}

type Decoder = fn(&[String]) -> Result<Command>;

/// Command name, field count, decoder.
const COMMAND_TABLE: &[(&str, Arity, Decoder)] = &[
    ("get_max_layer_size", Arity::Exact(2), decode_get_max_layer_size),
    ("get_cropped_images", Arity::Exact(3), decode_get_cropped_images),
    ("output_images", Arity::AtLeast(3), decode_output_images),
    ("release_shared_memory", Arity::Exact(1), decode_release_shared_memory),
    ("set_gmic_command_name", Arity::Exact(2), decode_set_gmic_command_name),
];

impl Command {
    /// Decode a request from its fields. The first field names the command.
    pub fn decode(fields: &[String]) -> Result<Self> {
        let raw_name = fields
            .first()
            .ok_or_else(|| BridgeError::protocol("empty request"))?;
        let name = raw_name.strip_prefix(COMMAND_PREFIX).unwrap_or(raw_name);

        let (_, arity, decoder) = COMMAND_TABLE
            .iter()
            .find(|(command, _, _)| *command == name)
            .ok_or_else(|| BridgeError::protocol(format!("unknown command '{}'", raw_name)))?;

        if !arity.accepts(fields.len()) {
            return Err(BridgeError::protocol(format!(
                "'{}' expects {:?} fields, got {}",
                name,
                arity,
                fields.len()
            )));
        }

        decoder(fields)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::GetMaxLayerSize { .. } => "get_max_layer_size",
            Command::GetCroppedImages { .. } => "get_cropped_images",
            Command::OutputImages { .. } => "output_images",
            Command::ReleaseSharedMemory => "release_shared_memory",
            Command::SetGmicCommandName { .. } => "set_gmic_command_name",
        }
    }
}

fn field_value<'a>(field: &'a str, key: &str) -> Result<&'a str> {
    field
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or_else(|| BridgeError::protocol(format!("expected '{}=', got '{}'", key, field)))
}

fn parse_mode_code(field: &str) -> Result<i32> {
    let value = field_value(field, "mode")?;
    value
        .trim()
        .parse()
        .map_err(|_| BridgeError::protocol(format!("invalid mode '{}'", value)))
}

fn parse_crop_rect(field: &str) -> Result<CropRect> {
    let value = field_value(field, "croprect")?;
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<f64>, _>>()
        .map_err(|_| BridgeError::protocol(format!("invalid crop rectangle '{}'", value)))?;

    if parts.len() != 4 || parts.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0) {
        return Err(BridgeError::protocol(format!(
            "crop rectangle must be four fractions in [0, 1], got '{}'",
            value
        )));
    }

    Ok(CropRect {
        x: parts[0],
        y: parts[1],
        width: parts[2],
        height: parts[3],
    })
}

fn decode_get_max_layer_size(fields: &[String]) -> Result<Command> {
    Ok(Command::GetMaxLayerSize {
        mode: InputMode::from_code(parse_mode_code(&fields[1])?),
    })
}

fn decode_get_cropped_images(fields: &[String]) -> Result<Command> {
    Ok(Command::GetCroppedImages {
        mode: InputMode::from_code(parse_mode_code(&fields[1])?),
        crop: parse_crop_rect(&fields[2])?,
    })
}

fn decode_output_images(fields: &[String]) -> Result<Command> {
    let mode = OutputMode::from_code(parse_mode_code(&fields[1])?);
    let images = fields[2..]
        .iter()
        .map(|field| TransferUnit::parse(field_value(field, "layer")?))
        .collect::<Result<Vec<_>>>()?;

    Ok(Command::OutputImages { mode, images })
}

fn decode_release_shared_memory(_: &[String]) -> Result<Command> {
    Ok(Command::ReleaseSharedMemory)
}

fn decode_set_gmic_command_name(fields: &[String]) -> Result<Command> {
    Ok(Command::SetGmicCommandName {
        name: fields[1].clone(),
    })
}

/// A reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Single(String),
    Lines(Vec<String>),
}

impl Reply {
    pub fn done() -> Self {
        Reply::Single("done".to_string())
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Reply::Single(text) => encode_single(text),
            Reply::Lines(lines) => encode_fields(lines),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn multi_field_round_trip_drops_empty_fields() {
        let payload = encode_fields(&["a", "", "b"]);
        assert_eq!(payload, b"a\n\nb\n");
        assert_eq!(decode_payload(&payload).unwrap(), fields(&["a", "b"]));
    }

    #[test]
    fn payload_without_trailing_separator_is_one_field() {
        assert_eq!(decode_payload(b"3,4").unwrap(), fields(&["3,4"]));
        assert_eq!(decode_payload(b"a\nb").unwrap(), fields(&["a\nb"]));
        assert!(decode_payload(b"").unwrap().is_empty());
    }

    #[test]
    fn non_utf8_payload_is_rejected() {
        assert!(matches!(
            decode_payload(&[0xff, 0xfe]),
            Err(BridgeError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn frames_are_length_prefixed_little_endian() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"done").await.unwrap();
        assert_eq!(&wire[..4], &[4, 0, 0, 0]);

        let mut reader = &wire[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), b"done");
    }

    #[tokio::test]
    async fn oversized_and_negative_frames_are_rejected() {
        let mut negative: &[u8] = &(-1i32).to_le_bytes();
        assert!(matches!(
            read_frame(&mut negative).await,
            Err(BridgeError::ProtocolViolation(_))
        ));

        let too_big = (MAX_MESSAGE_SIZE as i32 + 1).to_le_bytes();
        let mut reader: &[u8] = &too_big;
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(BridgeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn decode_cropped_images_request() {
        let command = Command::decode(&fields(&[
            "gmic_qt_get_cropped_images",
            "mode=4",
            "croprect=0.25,0.5,0.5,0.25",
        ]))
        .unwrap();
        assert_eq!(
            command,
            Command::GetCroppedImages {
                mode: InputMode::ActiveAndAbove,
                crop: CropRect {
                    x: 0.25,
                    y: 0.5,
                    width: 0.5,
                    height: 0.25
                },
            }
        );
    }

    #[test]
    fn decode_output_images_request() {
        let command = Command::decode(&fields(&[
            "output_images",
            "mode=42",
            "layer=seg_a,2,3,8",
            "layer=seg_b,1,1,4",
        ]))
        .unwrap();
        match command {
            Command::OutputImages { mode, images } => {
                assert_eq!(mode, OutputMode::InPlace);
                assert_eq!(images.len(), 2);
                assert_eq!(images[0].name, "seg_a");
                assert_eq!(images[1].stride, 4);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn unknown_mode_value_falls_back() {
        let command = Command::decode(&fields(&["get_max_layer_size", "mode=99"])).unwrap();
        assert_eq!(
            command,
            Command::GetMaxLayerSize {
                mode: InputMode::ActiveLayer
            }
        );
    }

    #[test]
    fn malformed_requests_are_protocol_violations() {
        let bad = [
            fields(&[]),
            fields(&["reticulate_splines"]),
            fields(&["get_max_layer_size"]),
            fields(&["get_max_layer_size", "mode=abc"]),
            fields(&["get_max_layer_size", "1"]),
            fields(&["get_cropped_images", "mode=1", "croprect=0,0,1"]),
            fields(&["get_cropped_images", "mode=1", "croprect=0,0,2,1"]),
            fields(&["output_images", "mode=0"]),
            fields(&["output_images", "mode=0", "image=a,1,1,4"]),
            fields(&["release_shared_memory", "now"]),
        ];
        for request in bad {
            assert!(
                matches!(
                    Command::decode(&request),
                    Err(BridgeError::ProtocolViolation(_))
                ),
                "accepted {:?}",
                request
            );
        }
    }

    #[test]
    fn set_command_name_keeps_raw_label() {
        let command =
            Command::decode(&fields(&["set_gmic_command_name", "Artistic / Cartoon"])).unwrap();
        assert_eq!(
            command,
            Command::SetGmicCommandName {
                name: "Artistic / Cartoon".to_string()
            }
        );
        assert_eq!(command.name(), "set_gmic_command_name");
    }

    #[test]
    fn reply_encoding() {
        assert_eq!(Reply::done().encode(), b"done");
        let reply = Reply::Lines(vec!["a,1,1,4".into(), "b,2,2,8".into()]);
        assert_eq!(
            decode_payload(&reply.encode()).unwrap(),
            fields(&["a,1,1,4", "b,2,2,8"])
        );
    }
}
