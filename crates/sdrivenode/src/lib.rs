//! Shared networking utilities for the owner and ledger nodes:
//! - QUIC/TLS setup (self-signed ledger certificate, pinned by the owner)
//! - Length-prefixed, padded frames
//! - Shared `Msg` envelope for the request/response exchange

pub mod config;
pub mod ledger;
pub mod owner;
pub mod retry;

use anyhow::{anyhow, Result};
use quinn::{ClientConfig, ServerConfig};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

pub use sdriveproto::{
    Finalized, Hello, PremiumOffer, PremiumReq, RegisterAck, RegisterKey, Rejected, ShareSubmit, SubmitAck,
    SubmitTrip, SubmitVehicle, PROTO_VER,
};

/// Server name the ledger certificate is issued for and the owner dials.
pub const LEDGER_SERVER_NAME: &str = "sdrive-ledger";

/// On-wire padding targets (bytes). Keep constant to avoid size side-channels.
pub const PAD_TO_HELLO: usize = 1024;
pub const PAD_TO_SUBMIT: usize = 8192;
pub const PAD_TO_PREMIUM: usize = 4096;
pub const PAD_TO_SHARE: usize = 1024;

/// Frames above this are refused before the payload is read.
pub const MAX_FRAME_LEN: usize = 1 << 20;

// ------- Wire messages (serde) -------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg {
    Hello(Hello),
    RegisterKey(RegisterKey),
    RegisterAck(RegisterAck),
    SubmitVehicle(SubmitVehicle),
    SubmitTrip(SubmitTrip),
    SubmitAck(SubmitAck),
    PremiumReq(PremiumReq),
    PremiumOffer(PremiumOffer),
    ShareSubmit(ShareSubmit),
    Finalized(Finalized),
    Rejected(Rejected),
}

impl Msg {
    /// Padding bucket for this message class.
    pub fn pad_to(&self) -> usize {
        match self {
            Msg::Hello(_) | Msg::RegisterAck(_) | Msg::SubmitAck(_) | Msg::Rejected(_) => PAD_TO_HELLO,
            Msg::RegisterKey(_) | Msg::SubmitVehicle(_) | Msg::SubmitTrip(_) => PAD_TO_SUBMIT,
            Msg::PremiumReq(_) | Msg::PremiumOffer(_) => PAD_TO_PREMIUM,
            Msg::ShareSubmit(_) | Msg::Finalized(_) => PAD_TO_SHARE,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Hello(_) => "Hello",
            Msg::RegisterKey(_) => "RegisterKey",
            Msg::RegisterAck(_) => "RegisterAck",
            Msg::SubmitVehicle(_) => "SubmitVehicle",
            Msg::SubmitTrip(_) => "SubmitTrip",
            Msg::SubmitAck(_) => "SubmitAck",
            Msg::PremiumReq(_) => "PremiumReq",
            Msg::PremiumOffer(_) => "PremiumOffer",
            Msg::ShareSubmit(_) => "ShareSubmit",
            Msg::Finalized(_) => "Finalized",
            Msg::Rejected(_) => "Rejected",
        }
    }

    pub fn rejected(reason: impl Into<String>, retryable: bool) -> Self {
        Msg::Rejected(Rejected {
            reason: reason.into(),
            retryable,
        })
    }
}

// ------- Framing (length-prefixed + padded) -------

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("stream closed by peer")]
    Closed,
    #[error("frame of {0} bytes exceeds the frame size limit")]
    TooLarge(usize),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
}

fn pad_len(len: usize, pad_to: usize) -> usize {
    (pad_to - (len % pad_to)) % pad_to
}

/// `[u32 LE: byte_len] [bincode payload + zero padding]`
pub fn encode_frame(msg: &Msg, pad_to: usize) -> Result<Vec<u8>, FrameError> {
    let mut bytes = bincode::serialize(msg)?;
    let rem = pad_len(bytes.len(), pad_to);
    bytes.extend(std::iter::repeat(0u8).take(rem));
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    let mut frame = Vec::with_capacity(4 + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(&bytes);
    Ok(frame)
}

/// Decode a payload with its trailing zero padding still attached.
pub fn decode_payload(buf: &[u8]) -> Result<Msg, FrameError> {
    // bincode ignores trailing bytes, so the padding needs no trimming.
    Ok(bincode::deserialize::<Msg>(buf)?)
}

/// Send a single framed message, padded to its class bucket.
pub async fn send_msg(send: &mut quinn::SendStream, msg: &Msg) -> Result<(), FrameError> {
    use tokio::io::AsyncWriteExt;

    let frame = encode_frame(msg, msg.pad_to())?;
    AsyncWriteExt::write_all(send, &frame).await?;
    AsyncWriteExt::flush(send).await?;
    Ok(())
}

/// Read a single framed message. A clean end of stream before the length
/// prefix is reported as [`FrameError::Closed`].
pub async fn read_msg(recv: &mut quinn::RecvStream) -> Result<Msg, FrameError> {
    use tokio::io::AsyncReadExt;

    let mut len_le = [0u8; 4];
    match AsyncReadExt::read_exact(recv, &mut len_le).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(e.into()),
    }
    let n = u32::from_le_bytes(len_le) as usize;
    if n > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(n));
    }

    let mut buf = vec![0u8; n];
    AsyncReadExt::read_exact(recv, &mut buf).await?;
    decode_payload(&buf)
}

// ------- QUIC / TLS helpers -------

/// Generate a self-signed certificate for the ledger.
/// Returns (ServerConfig, server_cert_der) so owners can pin it.
pub fn make_server_config_self_signed(common_name: &str) -> Result<(ServerConfig, CertificateDer<'static>)> {
    let rcgen::CertifiedKey { cert, signing_key } = generate_simple_self_signed(vec![common_name.to_string()])?;
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    let server_config = quinn::ServerConfig::with_single_cert(vec![cert_der.clone()], key)?;
    Ok((server_config, cert_der))
}

/// Build a QUIC client config that trusts only the provided ledger certificate.
pub fn make_client_config_with_root(server_cert: &CertificateDer<'static>) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(server_cert.clone())
        .map_err(|_| anyhow!("failed to add root cert"))?;
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(std::time::Duration::from_secs(5)));
    let mut client_config = quinn::ClientConfig::with_root_certificates(roots.into())?;
    client_config.transport_config(transport.into());
    Ok(client_config)
}

/// Install the fmt subscriber used by every binary. `RUST_LOG` overrides
/// `default_directive`.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rug::Integer;
    use sdrivecrypto::split::DerivedShare;

    fn hello(nonce: [u8; 16]) -> Msg {
        Msg::Hello(Hello {
            proto_ver: PROTO_VER,
            node_id: "owner-1".into(),
            nonce,
        })
    }

    #[test]
    fn hello_frames_pad_to_constant_bucket() {
        let mut nonce = [0u8; 16];
        let a = encode_frame(&hello(nonce), PAD_TO_HELLO).unwrap();
        nonce[0] = 0xff;
        let b = encode_frame(&hello(nonce), PAD_TO_HELLO).unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!((a.len() - 4) % PAD_TO_HELLO, 0);
    }

    #[test]
    fn share_frames_hide_integer_width() {
        let share = |r: u64| {
            Msg::ShareSubmit(ShareSubmit {
                share: DerivedShare {
                    result_id: "result_t1".into(),
                    r_prime: Integer::from(r),
                },
            })
        };
        let small = share(7);
        let large = share(u64::MAX);
        assert_eq!(
            encode_frame(&small, small.pad_to()).unwrap().len(),
            encode_frame(&large, large.pad_to()).unwrap().len()
        );
    }

    #[test]
    fn padded_payload_decodes() {
        let msg = Msg::rejected("unknown trip `t9`", false);
        let frame = encode_frame(&msg, msg.pad_to()).unwrap();
        let len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(decode_payload(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn garbage_payload_is_a_codec_error() {
        assert!(matches!(decode_payload(&[0xff; 8]), Err(FrameError::Codec(_))));
    }
}
