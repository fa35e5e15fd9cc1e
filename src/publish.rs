//! Encapsulation publisher (C4): owns one multicast UDP socket per worker,
//! assembles the wire-format datagram described in §6, and tracks the
//! monotonic per-stream sequence number.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};
use crate::record::Iovec;
use crate::stats::StreamStats;

/// Magic value identifying a telescope-multiplexer datagram on the wire.
pub const NDAG_MAGIC: u32 = 0x4e44_4147; // "NDAG"
pub const NDAG_VERSION: u8 = 1;

pub const NDAG_TYPE_DATA: u8 = 1;
pub const NDAG_TYPE_BEACON: u8 = 2;

pub const COMMON_HEADER_LEN: usize = 8;
pub const ENCAP_HEADER_LEN: usize = 10;
/// Fixed wire overhead every data datagram pays before record bodies begin.
pub const ENCAP_OVERHEAD: usize = COMMON_HEADER_LEN + ENCAP_HEADER_LEN;

/// Adjacent stream export ports share one multicast group and differ by
/// this stride, so a receiver can enumerate streams purely from the port
/// number (§4.4).
pub const PORT_INCR: u16 = 2;

/// How often the beacon announces the publisher (§4.4).
pub const BEACON_FREQ_MS: u64 = 1000;

/// Upper bound on how many datagrams a worker builds before yielding back to
/// the capture ring for a fresh window (§4.4, mirroring `NDAG_BATCH_SIZE` in
/// the original design).
pub const BATCH_SIZE: u16 = 64;

/// One multicast destination for a worker (§3).
#[derive(Debug, Clone)]
pub struct Sink {
    pub color: u8,
    pub monitorid: u16,
    pub export_port: u16,
    pub group: Ipv4Addr,
    pub source: Ipv4Addr,
    pub mtu: u16,
}

fn build_socket(source: Ipv4Addr, ttl: u32) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_multicast_loop_v4(true)?;
    socket.bind(&SocketAddrV4::new(source, 0).into())?;
    Ok(socket)
}

fn write_common_header(buf: &mut Vec<u8>, dgram_type: u8, monitorid: u16) {
    buf.extend_from_slice(&NDAG_MAGIC.to_be_bytes());
    buf.push(NDAG_VERSION);
    buf.push(dgram_type);
    buf.extend_from_slice(&monitorid.to_be_bytes());
}

fn write_encap_header(
    buf: &mut Vec<u8>,
    stream_index: u16,
    seqno: u32,
    record_count: u16,
    truncated: bool,
) {
    buf.extend_from_slice(&stream_index.to_be_bytes());
    buf.extend_from_slice(&seqno.to_be_bytes());
    buf.extend_from_slice(&record_count.to_be_bytes());
    buf.push(if truncated { 1 } else { 0 });
    buf.push(0); // reserved
}

/// Per-worker publisher state (§3). One instance per stream; created at
/// worker start, destroyed at worker exit.
pub struct EncapState {
    socket: Socket,
    dest: SocketAddr,
    monitorid: u16,
    stream_index: u16,
    mtu: u16,
    seqno: u32,
    scratch: Vec<u8>,
}

impl EncapState {
    /// Opens and binds the socket, preparing the outer framing template
    /// (§4.4). `global_start` is unused on the wire by the data path itself
    /// but is retained on [`crate::orchestrator::StreamParams`] for the
    /// beacon and for downstream timebase reconstruction.
    pub fn init(sink: &Sink, stream_index: u16) -> Result<Self> {
        let socket = build_socket(sink.source, 16).map_err(|e| Error::StreamOpenFailed {
            device: sink.group.to_string(),
            stream: stream_index,
            inner: e.to_string(),
        })?;
        let dest = SocketAddr::from((sink.group, sink.export_port));
        Ok(EncapState {
            socket,
            dest,
            monitorid: sink.monitorid,
            stream_index,
            mtu: sink.mtu,
            seqno: 0,
            scratch: Vec::with_capacity(sink.mtu as usize),
        })
    }

    pub fn budget(&self) -> usize {
        self.mtu as usize - ENCAP_OVERHEAD
    }

    /// Assembles and sends one datagram carrying `iovecs`' referenced bytes
    /// from `window`, in order. `record_count` is the total across every
    /// iovec in this bundle; `truncated` is set when the bundle is a single
    /// record that alone exceeds the MTU budget (§4.4).
    pub fn push(
        &mut self,
        window: &[u8],
        iovecs: &[Iovec],
        record_count: u16,
        stats: &StreamStats,
    ) -> Result<()> {
        let payload_len: usize = iovecs.iter().map(|iov| iov.len).sum();
        let truncated = record_count == 1 && payload_len > self.budget();
        if truncated {
            stats.record_truncated();
        }

        self.scratch.clear();
        write_common_header(&mut self.scratch, NDAG_TYPE_DATA, self.monitorid);
        write_encap_header(
            &mut self.scratch,
            self.stream_index,
            self.seqno,
            record_count,
            truncated,
        );
        for iov in iovecs {
            self.scratch
                .extend_from_slice(&window[iov.base..iov.base + iov.len]);
        }

        self.socket
            .send_to(&self.scratch, &self.dest.into())
            .map_err(|e| Error::PublishSendFailed {
                stream: self.stream_index,
                inner: e,
            })?;

        stats.record_transmitted(
            record_count as u64,
            self.scratch.len() as u64,
            payload_len as u64,
        );
        self.seqno = self.seqno.wrapping_add(1);
        Ok(())
    }

    pub fn sequence(&self) -> u32 {
        self.seqno
    }
}

/// Publisher for the periodic beacon (§4.4): announces the monitor id and
/// the currently active `(stream_index, export_port)` pairs on its own
/// sequence space and its own socket.
pub struct BeaconState {
    socket: Socket,
    dest: SocketAddr,
    monitorid: u16,
    seqno: u32,
}

impl BeaconState {
    pub fn init(source: Ipv4Addr, group: Ipv4Addr, port: u16, monitorid: u16) -> Result<Self> {
        let socket = build_socket(source, 16).map_err(|e| Error::StreamOpenFailed {
            device: group.to_string(),
            stream: 0,
            inner: e.to_string(),
        })?;
        Ok(BeaconState {
            socket,
            dest: SocketAddr::from((group, port)),
            monitorid,
            seqno: 0,
        })
    }

    pub fn push(&mut self, streams: &[(u16, u16)]) -> Result<()> {
        let mut buf = Vec::with_capacity(COMMON_HEADER_LEN + 8 + streams.len() * 4);
        write_common_header(&mut buf, NDAG_TYPE_BEACON, self.monitorid);
        buf.extend_from_slice(&self.seqno.to_be_bytes());
        buf.extend_from_slice(&(BEACON_FREQ_MS as u32).to_be_bytes());
        buf.extend_from_slice(&(streams.len() as u16).to_be_bytes());
        for (stream_index, port) in streams {
            buf.extend_from_slice(&stream_index.to_be_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }

        self.socket
            .send_to(&buf, &self.dest.into())
            .map_err(|e| Error::PublishSendFailed {
                stream: 0,
                inner: e,
            })?;
        self.seqno = self.seqno.wrapping_add(1);
        Ok(())
    }
}
