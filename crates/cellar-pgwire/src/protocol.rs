//! PostgreSQL wire-protocol framing.
//!
//! Only what the front-end needs: startup handling (including SSLRequest
//! denial), the backend messages for cleartext auth, simple and minimal
//! extended query, and error responses in PostgreSQL's error-field format.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use cellar_core::{Error, ErrorClass, Result};

pub const PROTOCOL_V3: i32 = 196_608;
pub const SSL_REQUEST: i32 = 80_877_103;
pub const CANCEL_REQUEST: i32 = 80_877_102;
pub const GSSENC_REQUEST: i32 = 80_877_104;

/// Client startup outcome.
#[derive(Debug)]
pub enum Startup {
    /// Protocol 3.0 startup with its key/value parameters.
    Start(Vec<(String, String)>),
    /// Client asked to cancel another backend; we just close.
    Cancel,
}

/// A frontend message after startup.
#[derive(Debug)]
pub struct Frame {
    pub tag: u8,
    pub body: Vec<u8>,
}

/// Read the startup packet, transparently denying SSL/GSS encryption
/// requests (the client falls back to plaintext and re-sends startup).
pub async fn read_startup<S>(stream: &mut S) -> Result<Startup>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let len = stream.read_i32().await.map_err(io_closed)?;
        if !(8..=10_000).contains(&len) {
            return Err(Error::InvalidArgument("malformed startup packet".into()));
        }
        let mut body = vec![0u8; (len - 4) as usize];
        stream.read_exact(&mut body).await.map_err(io_closed)?;
        let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);

        match code {
            SSL_REQUEST | GSSENC_REQUEST => {
                // TLS is not configured on this listener.
                stream.write_all(b"N").await.map_err(io_closed)?;
                continue;
            }
            CANCEL_REQUEST => return Ok(Startup::Cancel),
            PROTOCOL_V3 => {
                let mut params = Vec::new();
                let mut rest = &body[4..];
                while let Some(zero) = rest.iter().position(|&b| b == 0) {
                    if zero == 0 {
                        break;
                    }
                    let key = String::from_utf8_lossy(&rest[..zero]).to_string();
                    rest = &rest[zero + 1..];
                    let Some(zero) = rest.iter().position(|&b| b == 0) else {
                        break;
                    };
                    let value = String::from_utf8_lossy(&rest[..zero]).to_string();
                    rest = &rest[zero + 1..];
                    params.push((key, value));
                }
                return Ok(Startup::Start(params));
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unsupported protocol version {other}"
                )))
            }
        }
    }
}

/// Read one framed frontend message.
pub async fn read_frame<S>(stream: &mut S) -> Result<Frame>
where
    S: AsyncRead + Unpin,
{
    let tag = stream.read_u8().await.map_err(io_closed)?;
    let len = stream.read_i32().await.map_err(io_closed)?;
    if !(4..=64 * 1024 * 1024).contains(&len) {
        return Err(Error::InvalidArgument("malformed message length".into()));
    }
    let mut body = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut body).await.map_err(io_closed)?;
    Ok(Frame { tag, body })
}

/// Read a NUL-terminated string out of a message body.
pub fn take_cstring(body: &[u8]) -> Result<(String, &[u8])> {
    let zero = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::InvalidArgument("unterminated string in message".into()))?;
    Ok((
        String::from_utf8_lossy(&body[..zero]).to_string(),
        &body[zero + 1..],
    ))
}

// ─── Backend message builders ──────────────────────────────────────────────

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(tag);
    out.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
    out.extend_from_slice(body);
    out
}

pub fn auth_cleartext_password() -> Vec<u8> {
    frame(b'R', &3i32.to_be_bytes())
}

pub fn auth_ok() -> Vec<u8> {
    frame(b'R', &0i32.to_be_bytes())
}

pub fn parameter_status(key: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(key.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    frame(b'S', &body)
}

pub fn backend_key_data(pid: i32, secret: i32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&pid.to_be_bytes());
    body.extend_from_slice(&secret.to_be_bytes());
    frame(b'K', &body)
}

pub fn ready_for_query() -> Vec<u8> {
    frame(b'Z', b"I")
}

/// RowDescription with every column reported as text (OID 25).
pub fn row_description(columns: &[String]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(columns.len() as i16).to_be_bytes());
    for name in columns {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(&0i32.to_be_bytes()); // table OID
        body.extend_from_slice(&0i16.to_be_bytes()); // attribute number
        body.extend_from_slice(&25i32.to_be_bytes()); // type OID: text
        body.extend_from_slice(&(-1i16).to_be_bytes()); // type size
        body.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        body.extend_from_slice(&0i16.to_be_bytes()); // text format
    }
    frame(b'T', &body)
}

pub fn data_row(values: &[Option<String>]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(values.len() as i16).to_be_bytes());
    for value in values {
        match value {
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            Some(text) => {
                body.extend_from_slice(&(text.len() as i32).to_be_bytes());
                body.extend_from_slice(text.as_bytes());
            }
        }
    }
    frame(b'D', &body)
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = Vec::from(tag.as_bytes());
    body.push(0);
    frame(b'C', &body)
}

pub fn parse_complete() -> Vec<u8> {
    frame(b'1', &[])
}

pub fn bind_complete() -> Vec<u8> {
    frame(b'2', &[])
}

pub fn close_complete() -> Vec<u8> {
    frame(b'3', &[])
}

pub fn no_data() -> Vec<u8> {
    frame(b'n', &[])
}

pub fn empty_query_response() -> Vec<u8> {
    frame(b'I', &[])
}

/// ErrorResponse with severity, SQLSTATE, and message fields.
pub fn error_response(class: ErrorClass, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [
        (b'S', "ERROR"),
        (b'V', "ERROR"),
        (b'C', class.sqlstate()),
        (b'M', message),
    ] {
        body.push(field);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    frame(b'E', &body)
}

fn io_closed(e: std::io::Error) -> Error {
    Error::Io(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let msg = command_complete("SELECT 1");
        assert_eq!(msg[0], b'C');
        let len = i32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]);
        assert_eq!(len as usize, msg.len() - 1);
        assert_eq!(&msg[5..13], b"SELECT 1");
        assert_eq!(*msg.last().unwrap(), 0);
    }

    #[test]
    fn test_row_description_reports_text_columns() {
        let msg = row_description(&["id".to_string(), "amt".to_string()]);
        assert_eq!(msg[0], b'T');
        let count = i16::from_be_bytes([msg[5], msg[6]]);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_data_row_null_encoding() {
        let msg = data_row(&[Some("4".to_string()), None]);
        assert_eq!(msg[0], b'D');
        // Field count 2, then "4" with length 1, then -1 for NULL.
        let count = i16::from_be_bytes([msg[5], msg[6]]);
        assert_eq!(count, 2);
        let first_len = i32::from_be_bytes([msg[7], msg[8], msg[9], msg[10]]);
        assert_eq!(first_len, 1);
        assert_eq!(msg[11], b'4');
        let second_len = i32::from_be_bytes([msg[12], msg[13], msg[14], msg[15]]);
        assert_eq!(second_len, -1);
    }

    #[test]
    fn test_error_response_carries_sqlstate() {
        let msg = error_response(ErrorClass::Unauthenticated, "no");
        let text = String::from_utf8_lossy(&msg);
        assert!(text.contains("28P01"));
        assert!(text.contains("no"));
    }

    #[test]
    fn test_take_cstring() {
        let body = b"hello\0rest";
        let (s, rest) = take_cstring(body).unwrap();
        assert_eq!(s, "hello");
        assert_eq!(rest, b"rest");
        assert!(take_cstring(b"unterminated").is_err());
    }

    #[tokio::test]
    async fn test_startup_denies_ssl_then_accepts_v3() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let startup = read_startup(&mut server).await.unwrap();
            match startup {
                Startup::Start(params) => params,
                _ => panic!("expected start"),
            }
        });

        // SSLRequest.
        let mut ssl = Vec::new();
        ssl.extend_from_slice(&8i32.to_be_bytes());
        ssl.extend_from_slice(&SSL_REQUEST.to_be_bytes());
        client.write_all(&ssl).await.unwrap();
        let mut answer = [0u8; 1];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer, b"N");

        // Real startup.
        let mut body = Vec::new();
        body.extend_from_slice(&PROTOCOL_V3.to_be_bytes());
        body.extend_from_slice(b"user\0ws_w1_abc\0database\0workspace_w1\0\0");
        let mut packet = Vec::new();
        packet.extend_from_slice(&((body.len() as i32 + 4).to_be_bytes()));
        packet.extend_from_slice(&body);
        client.write_all(&packet).await.unwrap();

        let params = server_task.await.unwrap();
        assert!(params.contains(&("user".to_string(), "ws_w1_abc".to_string())));
        assert!(params.contains(&("database".to_string(), "workspace_w1".to_string())));
    }
}
