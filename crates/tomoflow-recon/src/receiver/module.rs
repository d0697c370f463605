use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tomoflow_core::{ReconError, Result};

use super::notification::ScanNotification;
use crate::geometry::ScanGeometry;

/// Wire header: LE u64 scan index followed by LE u16 part id.
const PACKET_HEADER_BYTES: usize = 8 + 2;

/// One UDP listener bound to a single detector module.
///
/// Packets carry a slice of one scan: `projections_per_packet` projections
/// of this module's detector channels. Completed scans are reported to the
/// shared [`ScanNotification`]; the packet sequence is monitored so drops
/// show up in the log (the notification protocol tolerates them).
pub struct ReceiverModule {
    socket: UdpSocket,
    module_id: usize,
    buffer: Arc<Mutex<Vec<u16>>>,
    notification: Arc<ScanNotification>,
    running: Arc<AtomicBool>,
    geometry: ScanGeometry,
    projections_per_packet: usize,
    timeout: Duration,
}

impl ReceiverModule {
    pub fn bind(
        address: &str,
        port: u16,
        module_id: usize,
        geometry: ScanGeometry,
        projections_per_packet: usize,
        timeout: Duration,
        buffer: Arc<Mutex<Vec<u16>>>,
        notification: Arc<ScanNotification>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        if projections_per_packet == 0 || geometry.projections % projections_per_packet != 0 {
            return Err(ReconError::Config(format!(
                "projectionsPerPacket ({projections_per_packet}) must divide the projection count ({})",
                geometry.projections
            )));
        }

        let socket = UdpSocket::bind((address, port))?;
        socket.set_read_timeout(Some(timeout))?;
        tracing::debug!(
            module = module_id,
            addr = %socket.local_addr()?,
            "receiver module listening"
        );

        Ok(Self {
            socket,
            module_id,
            buffer,
            notification,
            running,
            geometry,
            projections_per_packet,
            timeout,
        })
    }

    /// Port this module actually listens on (useful when bound to port 0).
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Receive until the socket times out or the receiver is stopped.
    pub fn run(&self) {
        let chunk = self.projections_per_packet * self.geometry.detectors_per_module();
        let slice_len = self.geometry.projections * self.geometry.detectors_per_module();
        let parts = self.geometry.projections / self.projections_per_packet;
        let mut packet = vec![0u8; PACKET_HEADER_BYTES + chunk * 2];
        let mut last_seq: Option<u64> = None;

        while self.running.load(Ordering::Relaxed) {
            let received = match self.socket.recv(&mut packet) {
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    tracing::info!(
                        module = self.module_id,
                        timeout_s = self.timeout.as_secs(),
                        "no packets arriving, finishing"
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(module = self.module_id, error = %e, "receive failed, finishing");
                    break;
                }
            };
            if received < packet.len() {
                tracing::warn!(
                    module = self.module_id,
                    received,
                    expected = packet.len(),
                    "short packet skipped"
                );
                continue;
            }

            let index = u64::from_le_bytes(packet[0..8].try_into().expect("8-byte header"));
            let part = u16::from_le_bytes(packet[8..10].try_into().expect("2-byte part id")) as usize;
            if part >= parts {
                tracing::warn!(module = self.module_id, part, "part id out of range, skipped");
                continue;
            }

            let seq = index * parts as u64 + part as u64;
            if let Some(last) = last_seq {
                if seq > last + 1 {
                    tracing::warn!(
                        module = self.module_id,
                        last,
                        new = seq,
                        "lost packet or wrong order"
                    );
                }
            }
            last_seq = Some(seq);

            let slot = (index as usize % self.geometry.buffer_size) * slice_len + part * chunk;
            {
                let mut buffer = self.buffer.lock();
                for (dst, src) in buffer[slot..slot + chunk]
                    .iter_mut()
                    .zip(packet[PACKET_HEADER_BYTES..].chunks_exact(2))
                {
                    *dst = u16::from_le_bytes([src[0], src[1]]);
                }
            }

            if part + 1 == parts {
                self.notification.notify(self.module_id, index);
            }
        }

        self.notification.finish(self.module_id);
    }
}
