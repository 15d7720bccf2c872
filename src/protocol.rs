//! Framed request/response protocol spoken over a byte pipe, typically the
//! stdin/stdout of `castr chunk-server` behind ssh.
//!
//! Every frame is `{size: u64, type: u64, body: [size - 16]}`, little
//! endian. The handshake exchanges 64-bit feature bitmasks; afterwards the
//! client pulls chunks with `Request` and the server answers `Chunk` or
//! `Missing`. A `Chunk` frame may also travel client to server to push
//! into a writable store.

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use log::*;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use url::Url;

use crate::chunk::Chunk;
use crate::converter::Converters;
use crate::error::Error;
use crate::hash::{ChunkId, CHUNK_ID_LEN};
use crate::store::{Store, StoreOptions};

pub const CA_PROTOCOL_HELLO: u64 = 0x3c71_d094_8ca5_fbee;
pub const CA_PROTOCOL_REQUEST: u64 = 0x7c24_ae10_325c_6b8d;
pub const CA_PROTOCOL_CHUNK: u64 = 0xb537_2d05_1f4a_93e2;
pub const CA_PROTOCOL_MISSING: u64 = 0x418f_a6c1_9e70_2bd4;
pub const CA_PROTOCOL_GOODBYE: u64 = 0xad2f_1c96_0b85_e347;
pub const CA_PROTOCOL_ABORT: u64 = 0xe0c8_534b_72d9_16fa;

/// Feature bits exchanged in the handshake.
pub const CA_PROTOCOL_READABLE_STORE: u64 = 0x1;
pub const CA_PROTOCOL_WRITABLE_STORE: u64 = 0x2;
pub const CA_PROTOCOL_PULL_CHUNKS: u64 = 0x4;
pub const CA_PROTOCOL_PUSH_CHUNKS: u64 = 0x8;

/// `Chunk` frame flag: the body carries the storage form.
pub const CA_PROTOCOL_CHUNK_COMPRESSED: u64 = 0x1;

const FRAME_HEADER_SIZE: u64 = 16;
const MAX_BODY_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello { feature_flags: u64 },
    Request { flags: u64, id: ChunkId },
    Chunk { flags: u64, id: ChunkId, data: Bytes },
    Missing { id: ChunkId },
    Goodbye,
    Abort { message: String },
}

pub async fn read_message<R>(reader: &mut R) -> Result<Message, Error>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u64_le().await?;
    let kind = reader.read_u64_le().await?;
    if size < FRAME_HEADER_SIZE || size - FRAME_HEADER_SIZE > MAX_BODY_SIZE {
        return Err(Error::invalid_format(format!("bad frame size {}", size)));
    }
    let mut body = vec![0u8; (size - FRAME_HEADER_SIZE) as usize];
    reader.read_exact(&mut body).await?;
    match kind {
        CA_PROTOCOL_HELLO => {
            if body.len() != 8 {
                return Err(Error::invalid_format("bad hello frame"));
            }
            Ok(Message::Hello {
                feature_flags: LittleEndian::read_u64(&body),
            })
        }
        CA_PROTOCOL_REQUEST => {
            if body.len() != 8 + CHUNK_ID_LEN {
                return Err(Error::invalid_format("bad request frame"));
            }
            Ok(Message::Request {
                flags: LittleEndian::read_u64(&body[..8]),
                id: ChunkId::from_slice(&body[8..])?,
            })
        }
        CA_PROTOCOL_CHUNK => {
            if body.len() < 8 + CHUNK_ID_LEN {
                return Err(Error::invalid_format("bad chunk frame"));
            }
            Ok(Message::Chunk {
                flags: LittleEndian::read_u64(&body[..8]),
                id: ChunkId::from_slice(&body[8..8 + CHUNK_ID_LEN])?,
                data: Bytes::copy_from_slice(&body[8 + CHUNK_ID_LEN..]),
            })
        }
        CA_PROTOCOL_MISSING => Ok(Message::Missing {
            id: ChunkId::from_slice(&body)?,
        }),
        CA_PROTOCOL_GOODBYE => Ok(Message::Goodbye),
        CA_PROTOCOL_ABORT => Ok(Message::Abort {
            message: String::from_utf8_lossy(&body).into_owned(),
        }),
        other => Err(Error::invalid_format(format!(
            "unknown protocol frame type {:#018x}",
            other
        ))),
    }
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let (kind, body): (u64, Vec<u8>) = match message {
        Message::Hello { feature_flags } => {
            (CA_PROTOCOL_HELLO, feature_flags.to_le_bytes().to_vec())
        }
        Message::Request { flags, id } => {
            let mut body = flags.to_le_bytes().to_vec();
            body.extend_from_slice(id.as_slice());
            (CA_PROTOCOL_REQUEST, body)
        }
        Message::Chunk { flags, id, data } => {
            let mut body = flags.to_le_bytes().to_vec();
            body.extend_from_slice(id.as_slice());
            body.extend_from_slice(data);
            (CA_PROTOCOL_CHUNK, body)
        }
        Message::Missing { id } => (CA_PROTOCOL_MISSING, id.as_slice().to_vec()),
        Message::Goodbye => (CA_PROTOCOL_GOODBYE, Vec::new()),
        Message::Abort { message } => (CA_PROTOCOL_ABORT, message.as_bytes().to_vec()),
    };
    writer
        .write_u64_le(FRAME_HEADER_SIZE + body.len() as u64)
        .await?;
    writer.write_u64_le(kind).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

struct Conn<R, W> {
    reader: R,
    writer: W,
}

/// Chunk store on the far side of a framed connection.
pub struct RemoteStore<R, W> {
    conn: Mutex<Conn<R, W>>,
    server_features: u64,
    converters: Converters,
}

impl<R, W> RemoteStore<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Handshake over an established pipe.
    pub async fn connect(mut reader: R, mut writer: W) -> Result<Self, Error> {
        write_message(
            &mut writer,
            &Message::Hello {
                feature_flags: CA_PROTOCOL_PULL_CHUNKS | CA_PROTOCOL_PUSH_CHUNKS,
            },
        )
        .await?;
        let server_features = match read_message(&mut reader).await? {
            Message::Hello { feature_flags } => feature_flags,
            other => {
                return Err(Error::invalid_format(format!(
                    "expected hello, got {:?}",
                    other
                )))
            }
        };
        if server_features & CA_PROTOCOL_READABLE_STORE == 0 {
            return Err(Error::invalid_format("remote store is not readable"));
        }
        Ok(Self {
            conn: Mutex::new(Conn { reader, writer }),
            server_features,
            converters: Converters::compressed(),
        })
    }

    pub async fn goodbye(&self) -> Result<(), Error> {
        let mut conn = self.conn.lock().await;
        write_message(&mut conn.writer, &Message::Goodbye).await
    }
}

#[async_trait]
impl<R, W> Store for RemoteStore<R, W>
where
    R: AsyncRead + Unpin + Send + Sync,
    W: AsyncWrite + Unpin + Send + Sync,
{
    async fn get_chunk(&self, id: &ChunkId) -> Result<Chunk, Error> {
        let mut conn = self.conn.lock().await;
        write_message(&mut conn.writer, &Message::Request { flags: 0, id: *id }).await?;
        match read_message(&mut conn.reader).await? {
            Message::Chunk {
                flags,
                id: got,
                data,
            } if got == *id => {
                if flags & CA_PROTOCOL_CHUNK_COMPRESSED != 0 {
                    Ok(Chunk::from_storage(*id, data, self.converters.clone(), false))
                } else {
                    Ok(Chunk::from_plain_with_id(*id, data, false)?)
                }
            }
            Message::Missing { id: got } if got == *id => Err(Error::ChunkMissing(*id)),
            Message::Abort { message } => Err(Error::transport(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("remote store aborted: {}", message),
            ))),
            other => Err(Error::invalid_format(format!(
                "unexpected protocol frame {:?}",
                other
            ))),
        }
    }

    async fn has_chunk(&self, id: &ChunkId) -> Result<bool, Error> {
        match self.get_chunk(id).await {
            Ok(_) => Ok(true),
            Err(Error::ChunkMissing(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn store_chunk(&self, mut chunk: Chunk) -> Result<(), Error> {
        if self.server_features & CA_PROTOCOL_WRITABLE_STORE == 0 {
            return Err(Error::transport(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "remote store is not writable",
            )));
        }
        let id = chunk.id()?;
        let data = chunk.storage(&self.converters)?;
        let mut conn = self.conn.lock().await;
        write_message(
            &mut conn.writer,
            &Message::Chunk {
                flags: CA_PROTOCOL_CHUNK_COMPRESSED,
                id,
                data,
            },
        )
        .await
    }

    async fn remove_chunk(&self, _id: &ChunkId) -> Result<(), Error> {
        Err(Error::transport(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "remote store does not support chunk removal",
        )))
    }

    fn name(&self) -> String {
        "remote".to_string()
    }
}

/// Serve `store` over a framed pipe until the peer says goodbye or the
/// pipe closes.
pub async fn serve_store<R, W>(
    mut reader: R,
    mut writer: W,
    store: &dyn Store,
    writable: bool,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut features = CA_PROTOCOL_READABLE_STORE;
    if writable {
        features |= CA_PROTOCOL_WRITABLE_STORE;
    }
    write_message(
        &mut writer,
        &Message::Hello {
            feature_flags: features,
        },
    )
    .await?;
    match read_message(&mut reader).await? {
        Message::Hello { feature_flags } => {
            debug!("peer features {:#x}", feature_flags);
        }
        other => {
            return Err(Error::invalid_format(format!(
                "expected hello, got {:?}",
                other
            )))
        }
    }
    let converters = Converters::compressed();
    loop {
        let message = match read_message(&mut reader).await {
            Ok(message) => message,
            // A vanished peer is a normal end of session.
            Err(Error::Io(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        match message {
            Message::Request { id, .. } => match store.get_chunk(&id).await {
                Ok(mut chunk) => {
                    let data = chunk.storage(&converters)?;
                    write_message(
                        &mut writer,
                        &Message::Chunk {
                            flags: CA_PROTOCOL_CHUNK_COMPRESSED,
                            id,
                            data,
                        },
                    )
                    .await?;
                }
                Err(Error::ChunkMissing(_)) => {
                    write_message(&mut writer, &Message::Missing { id }).await?;
                }
                Err(err) => {
                    let _ = write_message(
                        &mut writer,
                        &Message::Abort {
                            message: err.to_string(),
                        },
                    )
                    .await;
                    return Err(err);
                }
            },
            Message::Chunk { flags, id, data } => {
                if !writable {
                    let _ = write_message(
                        &mut writer,
                        &Message::Abort {
                            message: "store is read-only".to_string(),
                        },
                    )
                    .await;
                    return Err(Error::invalid_format("push to read-only store"));
                }
                let chunk = if flags & CA_PROTOCOL_CHUNK_COMPRESSED != 0 {
                    Chunk::from_storage(id, data, converters.clone(), false)
                } else {
                    Chunk::from_plain_with_id(id, data, false)?
                };
                store.store_chunk(chunk).await?;
            }
            Message::Goodbye => return Ok(()),
            Message::Abort { message } => {
                return Err(Error::transport(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("peer aborted: {}", message),
                )))
            }
            other => {
                return Err(Error::invalid_format(format!(
                    "unexpected protocol frame {:?}",
                    other
                )))
            }
        }
    }
}

/// Store behind `ssh <host> castr chunk-server <path>`.
pub struct SshStore {
    remote: RemoteStore<ChildStdout, ChildStdin>,
    _child: Child,
}

impl SshStore {
    pub async fn connect(url: &Url, _opts: &StoreOptions) -> Result<Self, Error> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::invalid_format(format!("ssh store url {} has no host", url)))?;
        let target = if url.username().is_empty() {
            host.to_string()
        } else {
            format!("{}@{}", url.username(), host)
        };
        let mut child = Command::new("ssh")
            .arg(target)
            .arg(format!("castr chunk-server {}", url.path()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::invalid_format("ssh child without stdout"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::invalid_format("ssh child without stdin"))?;
        let remote = RemoteStore::connect(stdout, stdin).await?;
        Ok(Self {
            remote,
            _child: child,
        })
    }
}

#[async_trait]
impl Store for SshStore {
    async fn get_chunk(&self, id: &ChunkId) -> Result<Chunk, Error> {
        self.remote.get_chunk(id).await
    }
    async fn has_chunk(&self, id: &ChunkId) -> Result<bool, Error> {
        self.remote.has_chunk(id).await
    }
    async fn store_chunk(&self, chunk: Chunk) -> Result<(), Error> {
        self.remote.store_chunk(chunk).await
    }
    async fn remove_chunk(&self, id: &ChunkId) -> Result<(), Error> {
        self.remote.remove_chunk(id).await
    }
    fn name(&self) -> String {
        "ssh".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn message_codec_round_trip() {
        let id = ChunkId::digest(b"id");
        let messages = [
            Message::Hello { feature_flags: 0x5 },
            Message::Request { flags: 1, id },
            Message::Chunk {
                flags: CA_PROTOCOL_CHUNK_COMPRESSED,
                id,
                data: Bytes::from_static(b"payload"),
            },
            Message::Missing { id },
            Message::Goodbye,
            Message::Abort {
                message: "gone".to_string(),
            },
        ];
        for message in &messages {
            let mut buf = Vec::new();
            write_message(&mut buf, message).await.unwrap();
            let mut cursor = std::io::Cursor::new(buf);
            let decoded = read_message(&mut cursor).await.unwrap();
            assert_eq!(&decoded, message);
        }
    }

    #[tokio::test]
    async fn client_and_server_exchange_chunks() {
        let backend = Arc::new(MemStore::new("served"));
        let mut stored = Chunk::from_plain(b"served bytes".to_vec());
        let id = stored.id().unwrap();
        backend.store_chunk(stored).await.unwrap();

        let (client_end, server_end) = tokio::io::duplex(1024 * 1024);
        let (server_read, server_write) = tokio::io::split(server_end);
        let server = tokio::spawn(async move {
            serve_store(server_read, server_write, backend.as_ref(), true).await
        });

        let (client_read, client_write) = tokio::io::split(client_end);
        let store = RemoteStore::connect(client_read, client_write).await.unwrap();

        let mut fetched = store.get_chunk(&id).await.unwrap();
        assert_eq!(&fetched.data().unwrap()[..], b"served bytes");
        assert!(store.has_chunk(&id).await.unwrap());

        let missing = ChunkId::digest(b"absent");
        assert!(matches!(
            store.get_chunk(&missing).await,
            Err(Error::ChunkMissing(_))
        ));

        // Push a chunk, then read it back.
        let pushed = Chunk::from_plain(b"pushed bytes".to_vec());
        let mut expect = Chunk::from_plain(b"pushed bytes".to_vec());
        let pushed_id = expect.id().unwrap();
        store.store_chunk(pushed).await.unwrap();
        let mut back = store.get_chunk(&pushed_id).await.unwrap();
        assert_eq!(&back.data().unwrap()[..], b"pushed bytes");

        store.goodbye().await.unwrap();
        server.await.unwrap().unwrap();
    }
}
