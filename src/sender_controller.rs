use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::bwe::BandwidthEstimator;
use crate::config::StreamConfig;
use crate::id_types::UserId;
use crate::peer_conn::PeerConn;
use crate::protocol::TrackKind;

/// Per (slice, destination peer) bitrate controller. Reads RTCP addressed to
/// one outbound processed track, forwards PLIs to the publisher, and keeps
/// `optimal_bitrate` inside the configured bounds — from TWCC/GCC estimates
/// or from receiver-report loss, depending on the process mode.
pub struct SenderController {
    to_user: UserId,
    kind: TrackKind,
    ssrc: u32,
    sender: Arc<RTCRtpSender>,
    /// Destination peer's congestion-control estimate (GCC mode).
    estimator: Arc<BandwidthEstimator>,
    /// Publisher connection, target of forwarded keyframe requests.
    origin_pc: Arc<PeerConn>,
    optimal_bitrate: AtomicU64,
    min_bitrate: u64,
    max_bitrate: u64,
    /// Headroom subtracted from the shared estimate so audio keeps its share.
    audio_max_bitrate: u64,
    encoder_control_period: Duration,
}

impl SenderController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        to_user: UserId,
        kind: TrackKind,
        ssrc: u32,
        sender: Arc<RTCRtpSender>,
        estimator: Arc<BandwidthEstimator>,
        origin_pc: Arc<PeerConn>,
        stream: StreamConfig,
        audio_max_bitrate: u64,
        encoder_control_period_ms: u64,
    ) -> Arc<SenderController> {
        Arc::new(SenderController {
            to_user,
            kind,
            ssrc,
            sender,
            estimator,
            origin_pc,
            optimal_bitrate: AtomicU64::new(stream.default_bitrate),
            min_bitrate: stream.min_bitrate,
            max_bitrate: stream.max_bitrate,
            audio_max_bitrate,
            encoder_control_period: Duration::from_millis(encoder_control_period_ms),
        })
    }

    pub fn to_user(&self) -> &UserId {
        &self.to_user
    }

    pub fn sender(&self) -> Arc<RTCRtpSender> {
        self.sender.clone()
    }

    pub fn optimal_bitrate(&self) -> u64 {
        self.optimal_bitrate.load(Ordering::Relaxed)
    }

    fn cap_rate(&self, bitrate: u64) -> u64 {
        bitrate.clamp(self.min_bitrate, self.max_bitrate)
    }

    /// Loss-based update, receiver-report `fractionLost` in 1/256 units.
    /// Below ~2%: +5%. Above ~10%: multiply by (1 - loss/2). In between: hold.
    pub fn update_rate_from_loss(&self, loss: u8) {
        let prev = self.optimal_bitrate.load(Ordering::Relaxed);
        let next = if loss < 5 {
            prev * 269 / 256
        } else if loss > 25 {
            info!(to_user = %self.to_user, value = loss, "loss_threshold_exceeded");
            prev * (512 - u64::from(loss)) / 512
        } else {
            prev
        };
        self.optimal_bitrate
            .store(self.cap_rate(next), Ordering::Relaxed);
    }

    /// Start the controller loops: RTCP fan-in immediately, and in GCC mode a
    /// video bitrate ticker once the slice has produced its first frame.
    pub fn spawn_loops(
        self: &Arc<Self>,
        ready: CancellationToken,
        done: CancellationToken,
        gcc: bool,
    ) {
        let me = self.clone();
        let rtcp_done = done.clone();
        tokio::spawn(async move {
            me.read_rtcp_loop(rtcp_done, gcc).await;
        });

        if gcc && self.kind == TrackKind::Video {
            let me = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = done.cancelled() => return,
                    _ = ready.cancelled() => {}
                }
                me.gcc_loop(done).await;
            });
        }
    }

    async fn read_rtcp_loop(self: Arc<Self>, done: CancellationToken, gcc: bool) {
        let mut buf = vec![0u8; 1500];
        loop {
            tokio::select! {
                _ = done.cancelled() => return,
                result = self.sender.read(&mut buf) => match result {
                    Ok((packets, _)) => {
                        for packet in &packets {
                            if packet.as_any().is::<PictureLossIndication>() {
                                self.origin_pc.throttled_pli_request("pli_from_subscriber");
                                continue;
                            }
                            // with TWCC+GCC, REMB won't work and RRs are not needed
                            if gcc {
                                continue;
                            }
                            if let Some(report) = packet.as_any().downcast_ref::<ReceiverReport>() {
                                for reception in &report.reports {
                                    if reception.ssrc == self.ssrc {
                                        self.update_rate_from_loss(reception.fraction_lost);
                                    }
                                }
                            } else if packet
                                .as_any()
                                .is::<ReceiverEstimatedMaximumBitrate>()
                            {
                                debug!(to_user = %self.to_user, "remb_ignored");
                            }
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        // EOF and closed pipe mean the sender is gone: clean exit
                        if message.contains("EOF") || message.contains("closed") {
                            return;
                        }
                        error!(to_user = %self.to_user, error = %message, "read_sent_rtcp_failed");
                    }
                }
            }
        }
    }

    async fn gcc_loop(self: Arc<Self>, done: CancellationToken) {
        let mut ticker = tokio::time::interval(self.encoder_control_period);
        loop {
            tokio::select! {
                _ = done.cancelled() => return,
                _ = ticker.tick() => {
                    let target = self
                        .estimator
                        .target_bitrate()
                        .saturating_sub(self.audio_max_bitrate);
                    self.optimal_bitrate
                        .store(self.cap_rate(target), Ordering::Relaxed);
                    debug!(
                        to_user = %self.to_user,
                        target = target,
                        stats = ?self.estimator.stats(),
                        "gcc"
                    );
                }
            }
        }
    }
}
