//! Telegram channel over a byte stream (TCP in production)
//!
//! One writer task owns the write half and serializes all sends; one reader
//! task owns the read half and feeds the event queue in wire order.
//!
//! Encryption switches travel in-band through the writer queue, so the
//! telegram queued right before `enable_encryption` still goes out plain.
//! On the receive side a frame is opened according to its own `ENCRYPTED`
//! flag:
//! - encrypted frames need a frame opener; if none is installed yet the
//!   reader waits (bounded) for the switch
//! - plain frames are only accepted in plain mode; while encrypted the
//!   reader waits (bounded) for a pending disable, so nobody can inject
//!   plain telegrams before the authenticated disable was processed
//! - plain keep-alives are always accepted and dropped

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use dav_core::{DavError, DavResult};
use dav_crypto::{derive_frame_ciphers, ChannelRole, FrameOpener, FrameSealer, SessionKey, TAG_SIZE};
use dav_wire::{Frame, FrameDecoder, FrameFlags, Telegram, MAX_FRAME_SIZE};

use crate::{ChannelConfig, ChannelEvent, ChannelEvents, TelegramChannel};

enum WriterCommand {
    Telegram(Vec<u8>),
    EnableEncryption(FrameSealer),
    DisableEncryption,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReceiveMode {
    Plain,
    Encrypted,
}

#[derive(Clone, Copy)]
struct KeepAlive {
    send: Duration,
    receive: Duration,
}

struct Shared {
    closed: AtomicBool,
    encrypted: AtomicBool,
    keep_alive: Mutex<KeepAlive>,
    opener: Mutex<Option<FrameOpener>>,
    mode: watch::Sender<ReceiveMode>,
    events: mpsc::Sender<ChannelEvent>,
}

impl Shared {
    async fn report_closed(&self, reason: Option<String>) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(reason) = &reason {
                tracing::debug!("channel failed: {}", reason);
            }
            let _ = self.events.send(ChannelEvent::Closed(reason)).await;
        }
    }
}

/// Channel over any `AsyncRead + AsyncWrite` stream
pub struct StreamChannel {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<WriterCommand>,
    reader: Mutex<Option<JoinHandle<()>>>,
    remote_addr: Option<SocketAddr>,
}

impl StreamChannel {
    /// Start reader and writer tasks on `stream`
    pub fn spawn<S>(stream: S, remote_addr: Option<SocketAddr>, config: &ChannelConfig) -> (Arc<Self>, ChannelEvents)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let (mode_tx, _) = watch::channel(ReceiveMode::Plain);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            encrypted: AtomicBool::new(false),
            keep_alive: Mutex::new(KeepAlive {
                send: config.send_keep_alive,
                receive: config.receive_keep_alive,
            }),
            opener: Mutex::new(None),
            mode: mode_tx,
            events: events_tx,
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = tokio::spawn(read_loop(read_half, shared.clone(), config.mode_switch_wait));
        tokio::spawn(write_loop(write_half, shared.clone(), commands_rx));

        let channel = Arc::new(StreamChannel {
            shared,
            commands: commands_tx,
            reader: Mutex::new(Some(reader)),
            remote_addr,
        });
        (channel, events_rx)
    }

    /// Open a TCP connection
    pub async fn connect(addr: SocketAddr, config: &ChannelConfig) -> DavResult<(Arc<Self>, ChannelEvents)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DavError::TransportError(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DavError::TransportError(e.to_string()))?;
        Ok(Self::spawn(stream, Some(addr), config))
    }

    fn command(&self, command: WriterCommand) -> DavResult<()> {
        if self.is_closed() {
            return Err(DavError::ConnectionClosed);
        }
        self.commands.send(command).map_err(|_| DavError::ConnectionClosed)
    }
}

impl TelegramChannel for StreamChannel {
    fn send(&self, telegram: Telegram) -> DavResult<()> {
        let body = telegram.encode();
        if body.len() + TAG_SIZE > MAX_FRAME_SIZE {
            return Err(DavError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE - TAG_SIZE,
            });
        }
        self.command(WriterCommand::Telegram(body))
    }

    fn enable_encryption(&self, key: SessionKey, role: ChannelRole) -> DavResult<()> {
        let (sealer, opener) = derive_frame_ciphers(&key, role)?;
        *self.shared.opener.lock() = Some(opener);
        self.shared.mode.send_replace(ReceiveMode::Encrypted);
        self.shared.encrypted.store(true, Ordering::SeqCst);
        self.command(WriterCommand::EnableEncryption(sealer))
    }

    fn disable_encryption(&self) -> DavResult<()> {
        self.shared.mode.send_replace(ReceiveMode::Plain);
        self.shared.encrypted.store(false, Ordering::SeqCst);
        self.command(WriterCommand::DisableEncryption)
    }

    fn is_encrypted(&self) -> bool {
        self.shared.encrypted.load(Ordering::SeqCst)
    }

    fn set_keep_alive(&self, send: Duration, receive: Duration) {
        *self.shared.keep_alive.lock() = KeepAlive { send, receive };
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(WriterCommand::Close);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accepts incoming TCP links
pub struct TelegramListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ChannelConfig,
}

impl TelegramListener {
    pub async fn bind(addr: SocketAddr, config: ChannelConfig) -> DavResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DavError::TransportError(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DavError::TransportError(e.to_string()))?;
        Ok(TelegramListener {
            listener,
            local_addr,
            config,
        })
    }

    /// Take over a listener bound elsewhere. Needs a running runtime.
    pub fn from_std(listener: std::net::TcpListener, config: ChannelConfig) -> DavResult<Self> {
        listener
            .set_nonblocking(true)
            .map_err(|e| DavError::TransportError(e.to_string()))?;
        let listener = TcpListener::from_std(listener).map_err(|e| DavError::TransportError(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DavError::TransportError(e.to_string()))?;
        Ok(TelegramListener {
            listener,
            local_addr,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next incoming link
    pub async fn accept(&self) -> DavResult<(Arc<StreamChannel>, ChannelEvents)> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| DavError::TransportError(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DavError::TransportError(e.to_string()))?;
        Ok(StreamChannel::spawn(stream, Some(addr), &self.config))
    }
}

async fn write_loop<W>(mut writer: W, shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<WriterCommand>)
where
    W: AsyncWrite + Unpin,
{
    let mut sealer: Option<FrameSealer> = None;
    let reason = loop {
        let send_timeout = shared.keep_alive.lock().send;
        let body = match tokio::time::timeout(send_timeout, commands.recv()).await {
            Ok(Some(WriterCommand::Telegram(body))) => body,
            Ok(Some(WriterCommand::EnableEncryption(s))) => {
                sealer = Some(s);
                continue;
            }
            Ok(Some(WriterCommand::DisableEncryption)) => {
                sealer = None;
                continue;
            }
            Ok(Some(WriterCommand::Close)) | Ok(None) => {
                let _ = writer.shutdown().await;
                return;
            }
            Err(_) => Telegram::KeepAlive.encode(),
        };
        if let Err(e) = write_frame(&mut writer, sealer.as_mut(), body).await {
            break e.to_string();
        }
    };
    shared.report_closed(Some(reason)).await;
}

async fn write_frame<W>(writer: &mut W, sealer: Option<&mut FrameSealer>, body: Vec<u8>) -> DavResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = match sealer {
        Some(sealer) => {
            let flags = FrameFlags::new(FrameFlags::ENCRYPTED);
            let sealed = sealer.seal(&[flags.0], &body)?;
            Frame::new(flags, sealed)?
        }
        None => Frame::new(FrameFlags::NONE, body)?,
    };
    writer
        .write_all(&frame.serialize()?)
        .await
        .map_err(|e| DavError::TransportError(e.to_string()))
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, switch_wait: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut decoder = FrameDecoder::new();
    let mut mode = shared.mode.subscribe();

    let reason = loop {
        match decoder.decode(&mut buf) {
            Ok(Some(frame)) => {
                match open_frame(&shared, &mut mode, frame, switch_wait).await {
                    Ok(Some(telegram)) => {
                        if shared.events.send(ChannelEvent::Telegram(telegram)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => break Some(e.to_string()),
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => break Some(e.to_string()),
        }

        let receive_timeout = shared.keep_alive.lock().receive;
        match tokio::time::timeout(receive_timeout, reader.read_buf(&mut buf)).await {
            Ok(Ok(0)) => break None,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => break Some(DavError::TransportError(e.to_string()).to_string()),
            Err(_) => {
                break Some(
                    DavError::Timeout(format!("nothing received for {}ms", receive_timeout.as_millis())).to_string(),
                )
            }
        }
    };
    shared.report_closed(reason).await;
}

async fn open_frame(
    shared: &Shared,
    mode: &mut watch::Receiver<ReceiveMode>,
    frame: Frame,
    switch_wait: Duration,
) -> DavResult<Option<Telegram>> {
    let body = if frame.is_encrypted() {
        let has_opener = shared.opener.lock().is_some();
        if !has_opener {
            wait_for_mode(mode, ReceiveMode::Encrypted, switch_wait).await?;
        }
        let mut opener = shared.opener.lock();
        let opener = opener
            .as_mut()
            .ok_or_else(|| DavError::IllegalState("encrypted frame on a plain link".into()))?;
        opener.open(&[frame.header.flags.0], &frame.body)?
    } else {
        let encrypted = *mode.borrow() == ReceiveMode::Encrypted;
        if encrypted {
            let telegram = Telegram::decode(&frame.body)?;
            if telegram == Telegram::KeepAlive {
                return Ok(None);
            }
            wait_for_mode(mode, ReceiveMode::Plain, switch_wait).await?;
            return Ok(Some(telegram));
        }
        frame.body
    };

    match Telegram::decode(&body)? {
        Telegram::KeepAlive => Ok(None),
        telegram => Ok(Some(telegram)),
    }
}

async fn wait_for_mode(mode: &mut watch::Receiver<ReceiveMode>, wanted: ReceiveMode, wait: Duration) -> DavResult<()> {
    match tokio::time::timeout(wait, mode.wait_for(|m| *m == wanted)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(DavError::ConnectionClosed),
        Err(_) => Err(DavError::IllegalState(format!(
            "frame does not match the encryption mode of the link, expected {:?}",
            wanted
        ))),
    }
}
