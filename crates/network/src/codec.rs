use crate::error::{ConnectionFailure, NetworkError};
use crate::protocol::Envelope;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound for a single frame body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Write one length-prefixed envelope. Returns the number of bytes written.
pub async fn write_envelope<W>(
    writer: &mut W,
    envelope: &Envelope,
    max_message_size: usize,
) -> Result<usize, NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let data = envelope.serialize()?;
    if data.len() > max_message_size {
        return Err(NetworkError::connection(
            ConnectionFailure::MessageTooLarge,
            format!("{} bytes (max: {})", data.len(), max_message_size),
        ));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(data.len() + 4)
}

/// Read one length-prefixed envelope and the number of bytes consumed.
pub async fn read_envelope<R>(
    reader: &mut R,
    max_message_size: usize,
) -> Result<(Envelope, usize), NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await.map_err(eof_aware)?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    // Size check before allocating the body.
    if len > max_message_size {
        return Err(NetworkError::connection(
            ConnectionFailure::MessageTooLarge,
            format!("{} bytes (max: {})", len, max_message_size),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(eof_aware)?;
    let envelope = Envelope::deserialize(&data)?;
    Ok((envelope, len + 4))
}

fn eof_aware(e: io::Error) -> NetworkError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        NetworkError::connection(ConnectionFailure::UnexpectedEof, "stream closed by peer")
    } else {
        e.into()
    }
}
