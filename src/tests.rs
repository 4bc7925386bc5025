//! Cross-module scenario tests: store policy, room lifecycle, signaling
//! single-flight, slice fan-out. Media I/O is replaced by the mock transport
//! and the loopback pipeline; peer connections are real but never connected.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, StreamsConfig};
use crate::id_types::UserId;
use crate::peer_conn::PeerConn;
use crate::peer_server::{run_peer_server, PeerServer};
use crate::pipeline::LoopbackPipelineFactory;
use crate::protocol::{JoinRequest, TrackKind};
use crate::room::Room;
use crate::room_store::{JoinError, JoinKind, RoomStore};
use crate::types::AppContext;
use crate::ws::mock::{MockClient, MockTransport};
use crate::ws::WsChannel;

fn test_config() -> Config {
    Config {
        port: 8000,
        gcc: false,
        project_root: "./".to_string(),
        rust_log: "info".to_string(),
        dev_mode: true,
    }
}

fn test_store() -> Arc<RoomStore> {
    RoomStore::new(AppContext::new(
        test_config(),
        Arc::new(LoopbackPipelineFactory),
    ))
}

fn join_request(room: &str, user: &str, size: u32, duration: u32) -> JoinRequest {
    JoinRequest {
        room_id: room.to_string(),
        user_id: user.to_string(),
        size,
        duration,
        ..Default::default()
    }
    .sanitized("https://test.example")
}

/// Peer server wired to a mock socket and a real (unconnected) RTCPeerConnection.
async fn attach_peer(
    room: &Arc<Room>,
    join: JoinRequest,
) -> (Arc<PeerServer>, MockClient) {
    let (transport, client) = MockTransport::pair();
    let ws = Arc::new(WsChannel::new(transport));
    let pc = PeerConn::new(&join, &StreamsConfig::default())
        .await
        .expect("peer connection");
    let ps = PeerServer::new(join, room.clone(), pc, ws);
    room.connect_peer_server(&ps);
    (ps, client)
}

async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

mod store_policy {
    use super::*;

    #[tokio::test]
    async fn test_create_join_duplicate_full() {
        let store = test_store();

        let (room, kind) = store.join(&join_request("r1", "u1", 2, 30)).await.unwrap();
        assert_eq!(kind, JoinKind::Created);
        assert_eq!(room.user_count(), 1);

        let (_, kind) = store.join(&join_request("r1", "u2", 2, 30)).await.unwrap();
        assert_eq!(kind, JoinKind::Joined);

        // same user already live
        let err = store
            .join(&join_request("r1", "u1", 2, 30))
            .await
            .unwrap_err();
        assert_eq!(err, JoinError::Duplicate);

        // room met its size
        let err = store
            .join(&join_request("r1", "u3", 2, 30))
            .await
            .unwrap_err();
        assert_eq!(err, JoinError::Full);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_same_room_id_different_origins_do_not_collide() {
        let store = test_store();
        let join_a = join_request("shared", "u1", 2, 30);
        let mut join_b = join_request("shared", "u1", 2, 30);
        join_b.origin = "https://elsewhere.example".to_string();

        let (room_a, kind_a) = store.join(&join_a).await.unwrap();
        let (room_b, kind_b) = store.join(&join_b).await.unwrap();
        assert_eq!(kind_a, JoinKind::Created);
        assert_eq!(kind_b, JoinKind::Created);
        assert!(!Arc::ptr_eq(&room_a, &room_b));
        assert_eq!(store.count().await, 2);
    }

    #[tokio::test]
    async fn test_reconnect_increments_joined_count() {
        let store = test_store();
        let (room, _) = store.join(&join_request("r2", "u1", 2, 30)).await.unwrap();
        let u1 = UserId::from("u1");
        assert_eq!(room.joined_count_for_user(&u1), 1);

        room.disconnect_user(&u1);
        assert_eq!(room.connected(&u1), Some(false));

        let (room_again, kind) = store.join(&join_request("r2", "u1", 2, 30)).await.unwrap();
        assert_eq!(kind, JoinKind::Reconnected);
        assert!(Arc::ptr_eq(&room, &room_again));
        assert_eq!(room.joined_count_for_user(&u1), 2);
        assert_eq!(room.connected(&u1), Some(true));
    }

    #[tokio::test]
    async fn test_deleted_room_id_is_reusable() {
        let store = test_store();
        let (room, _) = store.join(&join_request("r3", "u1", 2, 30)).await.unwrap();

        store.delete_room(&room).await;
        assert!(room.is_deleted());
        assert_eq!(store.count().await, 0);
        // idempotent
        store.delete_room(&room).await;

        let (fresh, kind) = store.join(&join_request("r3", "u1", 2, 30)).await.unwrap();
        assert_eq!(kind, JoinKind::Created);
        assert!(!Arc::ptr_eq(&room, &fresh));
    }

    #[tokio::test]
    async fn test_empty_room_deletes_itself_before_running() {
        let store = test_store();
        let (room, _) = store.join(&join_request("r4", "u1", 2, 30)).await.unwrap();

        room.disconnect_user(&UserId::from("u1"));

        for _ in 0..200 {
            if room.is_deleted() && store.count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("empty room was not deleted");
    }
}

mod room_lifecycle {
    use super::*;

    async fn collect_kinds(client: &mut MockClient, until: &str) -> Vec<String> {
        let mut kinds = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(30), client.next_message())
                .await
                .expect("message stream stalled")
                .expect("client channel closed");
            let kind = message["kind"].as_str().unwrap_or_default().to_string();
            kinds.push(kind.clone());
            if kind == until {
                return kinds;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_countdown_and_end_fanout() {
        let store = test_store();
        let (room, _) = store.join(&join_request("life1", "u1", 1, 20)).await.unwrap();
        let (ps, mut client) = attach_peer(&room, join_request("life1", "u1", 1, 20)).await;

        assert_eq!(room.needed_tracks(), 2);
        assert!(!room.is_running());

        room.add_files(&UserId::from("u1"), vec!["rec-audio".to_string()]);

        room.inc_in_tracks_ready(&ps, TrackKind::Audio);
        assert_eq!(room.in_tracks_ready_count(), 1);
        assert!(!room.wait_for_all_token().is_cancelled());

        room.inc_in_tracks_ready(&ps, TrackKind::Video);
        assert_eq!(room.in_tracks_ready_count(), 2);
        assert!(room.wait_for_all_token().is_cancelled());
        assert!(room.is_running());

        let kinds = collect_kinds(&mut client, "end").await;
        assert_eq!(kinds.iter().filter(|k| *k == "start").count(), 1);
        assert_eq!(kinds.iter().filter(|k| *k == "ending").count(), 1);
        assert_eq!(kinds.last().map(String::as_str), Some("end"));

        assert!(room.end_token().is_cancelled());
        assert!(!room.is_running());

        wait_until(|| room.is_deleted(), "room deletion after grace").await;
        ps.close("test_done").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_payload_carries_files_index() {
        let store = test_store();
        let (room, _) = store.join(&join_request("life2", "u1", 1, 5)).await.unwrap();
        let (ps, mut client) = attach_peer(&room, join_request("life2", "u1", 1, 5)).await;

        room.add_files(
            &UserId::from("u1"),
            vec!["a.mkv".to_string(), "a.opus".to_string()],
        );
        room.inc_in_tracks_ready(&ps, TrackKind::Audio);
        room.inc_in_tracks_ready(&ps, TrackKind::Video);

        loop {
            let message = tokio::time::timeout(Duration::from_secs(30), client.next_message())
                .await
                .expect("stalled")
                .expect("closed");
            if message["kind"] == "end" {
                let files = &message["payload"]["u1"];
                assert_eq!(files.as_array().map(|a| a.len()), Some(2));
                break;
            }
        }
        ps.close("test_done").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_start_sent_once_on_audio_only() {
        let store = test_store();
        let (room, _) = store.join(&join_request("life3", "u1", 1, 600)).await.unwrap();
        let (ps, mut client) = attach_peer(&room, join_request("life3", "u1", 1, 600)).await;

        room.inc_in_tracks_ready(&ps, TrackKind::Audio);
        room.inc_in_tracks_ready(&ps, TrackKind::Video);
        // barrier reached once; drain the initial start
        let first = tokio::time::timeout(Duration::from_secs(5), client.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first["kind"], "start");

        // simulated page reload
        let u1 = UserId::from("u1");
        room.disconnect_user(&u1);
        let (_, kind) = store.join(&join_request("life3", "u1", 1, 600)).await.unwrap();
        assert_eq!(kind, JoinKind::Reconnected);
        let (ps2, mut client2) = attach_peer(&room, join_request("life3", "u1", 1, 600)).await;

        // counter is saturated: video re-ready must not produce a start
        room.inc_in_tracks_ready(&ps2, TrackKind::Video);
        room.inc_in_tracks_ready(&ps2, TrackKind::Audio);
        room.inc_in_tracks_ready(&ps2, TrackKind::Video);
        assert_eq!(room.in_tracks_ready_count(), room.needed_tracks());

        // signaling offers may interleave; across everything the reconnected
        // peer receives, exactly one start shows up (keyed on the audio track)
        let mut starts = 0;
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(500), client2.next_message()).await
        {
            if message["kind"] == "start" {
                starts += 1;
            }
        }
        assert_eq!(starts, 1);

        ps.close("test_done").await;
        ps2.close("test_done").await;
    }

    #[tokio::test]
    async fn test_out_tracks_ready_signaling_decisions() {
        let store = test_store();
        let (room, _) = store.join(&join_request("life4", "u1", 1, 600)).await.unwrap();
        let (ps, _client) = attach_peer(&room, join_request("life4", "u1", 1, 600)).await;

        // warm-up: signaling fires when every expected output exists
        assert!(!room.inc_out_tracks_ready());
        assert!(room.inc_out_tracks_ready());

        // reach running state
        room.inc_in_tracks_ready(&ps, TrackKind::Audio);
        room.inc_in_tracks_ready(&ps, TrackKind::Video);

        // running: audio+video pairs come back atomically, even counts only
        room.dec_out_tracks_ready();
        assert_eq!(room.out_tracks_ready_count(), 1);
        assert!(room.inc_out_tracks_ready());
        assert!(!room.inc_out_tracks_ready());
        assert!(room.inc_out_tracks_ready());

        ps.close("test_done").await;
    }

    #[tokio::test]
    async fn test_ending_delay_bounds() {
        let store = test_store();
        let (room, _) = store.join(&join_request("life5", "u1", 2, 600)).await.unwrap();
        assert_eq!(room.ending_delay(), 600 - 15);

        let (short, _) = store.join(&join_request("life6", "u1", 2, 5)).await.unwrap();
        assert_eq!(short.ending_delay(), 1);
    }

    #[tokio::test]
    async fn test_file_prefix_shape() {
        let store = test_store();
        let (room, _) = store.join(&join_request("fp1", "u1", 2, 30)).await.unwrap();
        let prefix = room.file_prefix(&UserId::from("u1"));
        // <timestamp>-n-<namespace>-i-<hid>-r-<roomId>-u-<userId>-c-<count>
        assert!(prefix.contains("-n-default-i-"));
        assert!(prefix.ends_with("-r-fp1-u-u1-c-1"));
        let timestamp = prefix.split("-n-").next().unwrap();
        assert_eq!(timestamp.len(), "20060102-150405.000".len());
    }
}

mod signaling {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rounds_are_single_flight_and_coalesce() {
        let store = test_store();
        let (room, _) = store.join(&join_request("sig1", "u1", 2, 600)).await.unwrap();
        let (ps, mut client) = attach_peer(&room, join_request("sig1", "u1", 2, 600)).await;

        let mixer = room.mixer();
        // first round: offers, then waits (unanswered) for the answer timeout
        let first = tokio::spawn(mixer.clone().managed_global_signaling("round_one"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // a burst of requests while the round is in flight
        for _ in 0..5 {
            mixer.clone().managed_global_signaling("burst").await;
        }
        first.await.unwrap();

        // exactly two offers: the in-flight round plus one coalesced follow-up
        let mut offers = 0;
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(200), client.next_message()).await
        {
            if message["kind"] == "offer" {
                offers += 1;
            }
        }
        assert_eq!(offers, 2);
        ps.close("test_done").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_round_after_room_end() {
        let store = test_store();
        let (room, _) = store.join(&join_request("sig2", "u1", 2, 600)).await.unwrap();
        let (ps, mut client) = attach_peer(&room, join_request("sig2", "u1", 2, 600)).await;

        room.end_token().cancel();
        room.mixer().managed_global_signaling("too_late").await;

        assert!(
            tokio::time::timeout(Duration::from_millis(200), client.next_message())
                .await
                .is_err(),
            "no offer may be sent after endCh closed"
        );
        ps.close("test_done").await;
    }
}

mod slice_fanout {
    use super::*;
    use crate::config::StreamConfig;
    use crate::mixer_slice::{MixerSlice, SliceParams};
    use crate::pipeline::{LoopbackPipeline, Pipeline, PipelineConfig};
    use crate::protocol::RecordingMode;
    use tokio_util::sync::CancellationToken;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    fn video_stream() -> StreamConfig {
        StreamConfig {
            min_bitrate: 150_000,
            default_bitrate: 1_000_000,
            max_bitrate: 2_500_000,
        }
    }

    async fn build_slice() -> (Arc<MixerSlice>, Arc<LoopbackPipeline>) {
        let origin_pc = PeerConn::new(
            &join_request("slice", "origin", 2, 30),
            &StreamsConfig::default(),
        )
        .await
        .unwrap();
        let pipeline = LoopbackPipeline::new(PipelineConfig {
            id: "video-origin-abc123".to_string(),
            file_prefix: "prefix".to_string(),
            kind: TrackKind::Video,
            codec: "VP8".to_string(),
            width: 800,
            height: 600,
            frame_rate: 30,
            fx: String::new(),
            recording_mode: RecordingMode::None,
            stream: video_stream(),
        });
        let slice = MixerSlice::new(SliceParams {
            from_user: UserId::from("origin"),
            origin_pc,
            origin_closed: CancellationToken::new(),
            kind: TrackKind::Video,
            capability: RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                ..Default::default()
            },
            pipeline: pipeline.clone(),
            stream: video_stream(),
            audio_max_bitrate: 64_000,
            encoder_control_period_ms: 1_000,
            gcc: false,
        });
        (slice, pipeline)
    }

    #[tokio::test]
    async fn test_attachments_create_one_controller_per_destination() {
        let (slice, _pipeline) = build_slice().await;
        let dest1 = PeerConn::new(
            &join_request("slice", "dest1", 2, 30),
            &StreamsConfig::default(),
        )
        .await
        .unwrap();
        let dest2 = PeerConn::new(
            &join_request("slice", "dest2", 2, 30),
            &StreamsConfig::default(),
        )
        .await
        .unwrap();

        slice
            .ensure_sender_for(&UserId::from("dest1"), &dest1)
            .await
            .unwrap();
        // repeat attachment is a no-op
        slice
            .ensure_sender_for(&UserId::from("dest1"), &dest1)
            .await
            .unwrap();
        slice
            .ensure_sender_for(&UserId::from("dest2"), &dest2)
            .await
            .unwrap();
        // never attach back to the publisher
        slice
            .ensure_sender_for(&UserId::from("origin"), &dest1)
            .await
            .unwrap();

        assert_eq!(slice.controllers().len(), 2);
        assert!(slice.has_sender_for(&UserId::from("dest1")));
        assert!(!slice.has_sender_for(&UserId::from("origin")));
        slice.stop().await;
    }

    #[tokio::test]
    async fn test_min_combiner_follows_slowest_destination() {
        let (slice, _pipeline) = build_slice().await;
        for user in ["dest1", "dest2"] {
            let dest = PeerConn::new(
                &join_request("slice", user, 2, 30),
                &StreamsConfig::default(),
            )
            .await
            .unwrap();
            slice
                .ensure_sender_for(&UserId::from(user), &dest)
                .await
                .unwrap();
        }
        assert_eq!(slice.min_optimal_bitrate(), Some(1_000_000));

        // one congested leg drags the encoder target down
        let congested = &slice.controllers()[0];
        congested.update_rate_from_loss(200);
        let expected = (1_000_000u64 * (512 - 200) / 512).clamp(150_000, 2_500_000);
        assert_eq!(slice.min_optimal_bitrate(), Some(expected));
        slice.stop().await;
    }

    #[tokio::test]
    async fn test_first_frame_closes_ready_latch() {
        let (slice, pipeline) = build_slice().await;
        assert!(!slice.ready_token().is_cancelled());
        slice.spawn_output_loops();

        pipeline.push(&[9, 9, 9]).await.unwrap();
        wait_until(|| slice.ready_token().is_cancelled(), "ready latch").await;

        slice.stop().await;
        assert!(slice.done_token().is_cancelled());
        // stop twice is a no-op
        slice.stop().await;
    }
}

mod pli_throttle {
    use super::*;
    use crate::metrics::KEYFRAMES_REQUESTED_TOTAL;

    #[tokio::test]
    async fn test_burst_collapses_to_one_per_window() {
        let pc = PeerConn::new(
            &join_request("pli", "u1", 2, 30),
            &StreamsConfig::default(),
        )
        .await
        .unwrap();
        pc.set_inbound_video_ssrc(777);

        let before = KEYFRAMES_REQUESTED_TOTAL.get();
        for _ in 0..10 {
            pc.throttled_pli_request("burst");
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        // only the first request of the burst goes out immediately
        assert_eq!(KEYFRAMES_REQUESTED_TOTAL.get(), before + 1);

        // the collapsed follow-up fires at the next slot
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(KEYFRAMES_REQUESTED_TOTAL.get(), before + 2);
        pc.close().await;
    }

    #[tokio::test]
    async fn test_no_pli_without_known_video_ssrc() {
        let pc = PeerConn::new(
            &join_request("pli2", "u1", 2, 30),
            &StreamsConfig::default(),
        )
        .await
        .unwrap();
        let before = KEYFRAMES_REQUESTED_TOTAL.get();
        pc.throttled_pli_request("no_ssrc");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(KEYFRAMES_REQUESTED_TOTAL.get(), before);
        pc.close().await;
    }
}

mod wire {
    use super::*;

    async fn expect_kind(client: &mut MockClient, kind: &str) {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(15), client.next_message())
                .await
                .expect("no message from server")
                .expect("server closed channel");
            if message["kind"] == kind {
                return;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_join_flow_emits_offer() {
        let store = test_store();
        let (transport, mut client) = MockTransport::pair();
        let server = tokio::spawn(run_peer_server(
            "https://wire.example".to_string(),
            transport,
            store.clone(),
        ));

        client.send_message("join", r#"{"roomId":"w1","userId":"u1","size":2,"duration":60}"#);
        expect_kind(&mut client, "offer").await;

        // hanging up empties the room before it ran, which deletes it
        drop(client);
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server task hung")
            .unwrap();
        for _ in 0..100 {
            if store.count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_user_is_rejected_and_first_unaffected() {
        let store = test_store();
        let (transport1, mut client1) = MockTransport::pair();
        let _server1 = tokio::spawn(run_peer_server(
            "https://wire.example".to_string(),
            transport1,
            store.clone(),
        ));
        client1.send_message("join", r#"{"roomId":"w2","userId":"u1","size":2}"#);
        expect_kind(&mut client1, "offer").await;

        let (transport2, mut client2) = MockTransport::pair();
        let server2 = tokio::spawn(run_peer_server(
            "https://wire.example".to_string(),
            transport2,
            store.clone(),
        ));
        client2.send_message("join", r#"{"roomId":"w2","userId":"u1","size":2}"#);
        expect_kind(&mut client2, "error-duplicate").await;
        server2.await.unwrap();
        assert!(client2.server_closed());

        // first session is untouched
        assert_eq!(store.count().await, 1);
        assert!(!client1.server_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_third_peer_gets_error_full() {
        let store = test_store();
        let mut clients = Vec::new();
        for user in ["u1", "u2"] {
            let (transport, mut client) = MockTransport::pair();
            tokio::spawn(run_peer_server(
                "https://wire.example".to_string(),
                transport,
                store.clone(),
            ));
            client.send_message(
                "join",
                &format!(r#"{{"roomId":"w3","userId":"{}","size":2}}"#, user),
            );
            expect_kind(&mut client, "offer").await;
            clients.push(client);
        }

        let (transport3, mut client3) = MockTransport::pair();
        let server3 = tokio::spawn(run_peer_server(
            "https://wire.example".to_string(),
            transport3,
            store.clone(),
        ));
        client3.send_message("join", r#"{"roomId":"w3","userId":"u3","size":2}"#);
        expect_kind(&mut client3, "error-full").await;
        server3.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_message_must_be_join() {
        let store = test_store();
        let (transport, mut client) = MockTransport::pair();
        let server = tokio::spawn(run_peer_server(
            "https://wire.example".to_string(),
            transport,
            store.clone(),
        ));
        client.send_message("candidate", "whatever");
        expect_kind(&mut client, "error-join").await;
        server.await.unwrap();
        assert_eq!(store.count().await, 0);
    }
}
