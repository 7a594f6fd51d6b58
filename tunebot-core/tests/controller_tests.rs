// File: tunebot-core/tests/controller_tests.rs

use std::time::Duration;

use tokio::time::timeout;
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, GuildMarker};

use tunebot_core::Error;
use tunebot_core::eventbus::BotEvent;
use tunebot_core::models::{JoinOutcome, PlayOutcome, PlaybackState, Song, Source};
use tunebot_core::platforms::TrackStatus;
use tunebot_core::playback::ControllerSettings;
use tunebot_core::test_utils::helpers::{TestController, eventually, spawn_test_controller, wait_for_state};

const GUILD: Id<GuildMarker> = Id::new(1);
const VOICE: Id<ChannelMarker> = Id::new(42);
const TEXT: Id<ChannelMarker> = Id::new(7);

fn stream(name: &str) -> Song {
    Song::new(
        format!("{name}.mp3"),
        Source::RemoteStream { url: format!("https://example.com/{name}.mp3") },
    )
}

fn settings() -> ControllerSettings {
    ControllerSettings {
        queue_enabled: true,
        loop_default: true,
        connect_timeout: Duration::from_secs(2),
    }
}

fn single_slot() -> ControllerSettings {
    ControllerSettings {
        queue_enabled: false,
        ..settings()
    }
}

async fn play(t: &TestController, name: &str) -> Result<PlayOutcome, Error> {
    t.handle.play(GUILD, VOICE, Some(TEXT), stream(name)).await
}

async fn played_count_reaches(t: &TestController, n: usize) -> bool {
    eventually(Duration::from_secs(2), || async { t.transport.played_sources(GUILD).len() >= n }).await
}

#[tokio::test]
async fn test_first_play_connects_then_plays() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    let mut rx = t.event_bus.subscribe(Some(64)).await;

    let outcome = play(&t, "a").await?;
    assert_eq!(outcome, PlayOutcome::Started { title: "a.mp3".into() });

    let mut transitions = Vec::new();
    while transitions.len() < 2 {
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("state event")
            .expect("bus open");
        if let BotEvent::StateChanged { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (PlaybackState::Idle, PlaybackState::Connecting),
            (PlaybackState::Connecting, PlaybackState::Playing),
        ]
    );

    let snapshot = t.handle.snapshot(GUILD).await?;
    assert!(snapshot.connected);
    assert_eq!(snapshot.voice_channel, Some(VOICE));
    assert_eq!(snapshot.now_playing, Some(stream("a")));
    Ok(())
}

#[tokio::test]
async fn test_play_while_playing_enqueues_fifo() -> Result<(), Error> {
    let t = spawn_test_controller(settings());

    assert!(matches!(play(&t, "a").await?, PlayOutcome::Started { .. }));
    for (i, name) in ["b", "c", "d"].iter().enumerate() {
        let outcome = play(&t, name).await?;
        assert_eq!(outcome, PlayOutcome::Queued { title: format!("{name}.mp3"), position: i + 1 });
    }
    // Enqueueing never interrupts.
    assert_eq!(t.transport.played_sources(GUILD).len(), 1);
    assert_eq!(t.handle.snapshot(GUILD).await?.queue, vec!["b.mp3", "c.mp3", "d.mp3"]);

    for n in 2..=4 {
        t.transport.finish_track(GUILD);
        assert!(played_count_reaches(&t, n).await, "track {n} never started");
    }

    let played = t.transport.played_sources(GUILD);
    let expected: Vec<Source> = ["a", "b", "c", "d"].iter().map(|n| stream(n).source).collect();
    assert_eq!(played, expected);
    assert!(t.handle.snapshot(GUILD).await?.queue.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stop_resets_everything() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    play(&t, "a").await?;
    play(&t, "b").await?;
    t.handle.set_loop(GUILD, false).await?;

    assert!(t.handle.stop(GUILD).await?);

    let snapshot = t.handle.snapshot(GUILD).await?;
    assert_eq!(snapshot.state, PlaybackState::Idle);
    assert!(snapshot.queue.is_empty());
    assert!(snapshot.now_playing.is_none());
    assert!(!snapshot.connected);
    assert!(snapshot.loop_enabled, "loop flag back to its default");
    assert!(!t.transport.is_connected(GUILD));
    assert_eq!(t.transport.disconnect_count(GUILD), 1);

    assert!(!t.handle.stop(GUILD).await?, "nothing left to stop");
    Ok(())
}

#[tokio::test]
async fn test_stop_while_connecting_leaves_no_connection() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    t.transport.gate_connects();

    let handle = t.handle.clone();
    let pending = tokio::spawn(async move { handle.play(GUILD, VOICE, Some(TEXT), stream("a")).await });
    wait_for_state(&t.handle, GUILD, PlaybackState::Connecting).await?;

    assert!(t.handle.stop(GUILD).await?);
    let result = pending.await.expect("play task");
    assert!(matches!(result, Err(Error::Superseded(_))), "{result:?}");

    // The connect finishes after the stop; that late connection must go.
    t.transport.release_connect();
    assert!(
        eventually(Duration::from_secs(2), || async {
            t.transport.disconnect_count(GUILD) >= 2 && !t.transport.is_connected(GUILD)
        })
        .await
    );

    let snapshot = t.handle.snapshot(GUILD).await?;
    assert_eq!(snapshot.state, PlaybackState::Idle);
    assert!(snapshot.now_playing.is_none());
    assert!(t.transport.played_sources(GUILD).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_loop_replays_the_same_stream() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    play(&t, "a").await?;

    t.transport.finish_track(GUILD);
    assert!(played_count_reaches(&t, 2).await);

    let played = t.transport.played_sources(GUILD);
    assert_eq!(played[0], played[1]);
    assert_eq!(t.handle.snapshot(GUILD).await?.state, PlaybackState::Playing);
    Ok(())
}

#[tokio::test]
async fn test_loop_off_goes_idle_but_stays_connected() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    play(&t, "a").await?;
    assert!(!t.handle.set_loop(GUILD, false).await?);

    t.transport.finish_track(GUILD);
    let snapshot = wait_for_state(&t.handle, GUILD, PlaybackState::Idle).await?;
    assert!(snapshot.now_playing.is_none());
    assert!(snapshot.connected);
    assert_eq!(t.transport.played_sources(GUILD).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_transport_error_is_announced_and_queue_advances() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    let mut rx = t.event_bus.subscribe(Some(64)).await;
    play(&t, "a").await?;
    play(&t, "b").await?;

    t.transport.report(GUILD, TrackStatus::Error("decoder exploded".into()));

    let mut saw_error_state = false;
    let notice = loop {
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event")
            .expect("bus open");
        match event {
            BotEvent::StateChanged { to: PlaybackState::Error, .. } => saw_error_state = true,
            BotEvent::PlaybackNotice { channel_id, text, .. } if text.starts_with("Error playing track") => {
                assert_eq!(channel_id, TEXT);
                break text;
            }
            _ => {}
        }
    };
    assert!(saw_error_state);
    assert!(notice.contains("a.mp3"));

    assert!(played_count_reaches(&t, 2).await);
    assert_eq!(t.transport.played_sources(GUILD)[1], stream("b").source);
    assert!(t.transport.is_connected(GUILD), "playback errors keep the connection");
    Ok(())
}

#[tokio::test]
async fn test_transport_error_never_loops() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    play(&t, "a").await?;

    t.transport.report(GUILD, TrackStatus::Error("404".into()));
    let snapshot = wait_for_state(&t.handle, GUILD, PlaybackState::Idle).await?;
    assert!(snapshot.now_playing.is_none());
    assert!(snapshot.connected);
    assert_eq!(t.transport.played_sources(GUILD).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_events_from_replaced_players_are_ignored() -> Result<(), Error> {
    let t = spawn_test_controller(single_slot());
    play(&t, "a").await?;
    let old = t.transport.current_token(GUILD).expect("a is playing");

    assert_eq!(play(&t, "b").await?, PlayOutcome::Started { title: "b.mp3".into() });
    t.transport.report_for(GUILD, old, TrackStatus::Idle);
    t.transport.report_for(GUILD, old, TrackStatus::Error("late".into()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = t.handle.snapshot(GUILD).await?;
    assert_eq!(snapshot.state, PlaybackState::Playing);
    assert_eq!(snapshot.now_playing, Some(stream("b")));
    assert_eq!(t.transport.played_sources(GUILD).len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_single_slot_supersedes_pending_request() -> Result<(), Error> {
    let t = spawn_test_controller(single_slot());
    t.transport.gate_connects();

    let handle = t.handle.clone();
    let first = tokio::spawn(async move { handle.play(GUILD, VOICE, None, stream("a")).await });
    wait_for_state(&t.handle, GUILD, PlaybackState::Connecting).await?;

    let handle = t.handle.clone();
    let second = tokio::spawn(async move { handle.play(GUILD, VOICE, None, stream("b")).await });

    let first = timeout(Duration::from_secs(1), first).await.expect("first resolves").expect("task");
    assert!(matches!(first, Err(Error::Superseded(_))), "{first:?}");

    t.transport.release_connect();
    let second = second.await.expect("task")?;
    assert_eq!(second, PlayOutcome::Started { title: "b.mp3".into() });
    assert_eq!(t.transport.played_sources(GUILD), vec![stream("b").source]);
    assert_eq!(t.transport.connect_count(GUILD), 1);
    Ok(())
}

#[tokio::test]
async fn test_queue_mode_enqueues_while_connecting() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    t.transport.gate_connects();

    let handle = t.handle.clone();
    let first = tokio::spawn(async move { handle.play(GUILD, VOICE, None, stream("a")).await });
    wait_for_state(&t.handle, GUILD, PlaybackState::Connecting).await?;

    assert_eq!(play(&t, "b").await?, PlayOutcome::Queued { title: "b.mp3".into(), position: 1 });

    t.transport.release_connect();
    assert!(matches!(first.await.expect("task")?, PlayOutcome::Started { .. }));

    t.transport.finish_track(GUILD);
    assert!(played_count_reaches(&t, 2).await);
    assert_eq!(t.transport.played_sources(GUILD)[1], stream("b").source);
    Ok(())
}

#[tokio::test]
async fn test_connect_failure_is_reported_and_reset() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    t.transport.fail_connects("missing Connect permission");

    let err = play(&t, "a").await.unwrap_err();
    assert!(matches!(err, Error::Connection(ref msg) if msg == "missing Connect permission"), "{err:?}");
    assert_eq!(err.to_string(), "Voice connection error: missing Connect permission");

    let snapshot = t.handle.snapshot(GUILD).await?;
    assert_eq!(snapshot.state, PlaybackState::Idle);
    assert!(!snapshot.connected);
    assert!(snapshot.voice_channel.is_none());
    assert!(t.transport.played_sources(GUILD).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_connect_timeout_is_upstream_timeout() -> Result<(), Error> {
    let t = spawn_test_controller(ControllerSettings {
        connect_timeout: Duration::from_millis(50),
        ..settings()
    });
    t.transport.gate_connects();

    let err = play(&t, "a").await.unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert_eq!(t.handle.snapshot(GUILD).await?.state, PlaybackState::Idle);
    Ok(())
}

#[tokio::test]
async fn test_play_failure_settles_idle() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    t.handle.join(GUILD, VOICE, None).await?;
    t.transport.fail_plays(Some("unsupported codec"));

    let err = play(&t, "a").await.unwrap_err();
    assert!(matches!(err, Error::TransportPlayback(_)));

    let snapshot = t.handle.snapshot(GUILD).await?;
    assert_eq!(snapshot.state, PlaybackState::Idle);
    assert!(snapshot.connected);
    Ok(())
}

#[tokio::test]
async fn test_join_binds_one_channel_at_a_time() -> Result<(), Error> {
    let t = spawn_test_controller(settings());

    assert_eq!(t.handle.join(GUILD, Id::new(10), None).await?, JoinOutcome::Joined);
    assert_eq!(t.handle.join(GUILD, Id::new(10), None).await?, JoinOutcome::AlreadyJoined);
    assert_eq!(t.handle.join(GUILD, Id::new(20), None).await?, JoinOutcome::Moved);

    assert_eq!(t.transport.connect_count(GUILD), 2);
    assert_eq!(t.transport.disconnect_count(GUILD), 1);
    let snapshot = t.handle.snapshot(GUILD).await?;
    assert_eq!(snapshot.voice_channel, Some(Id::new(20)));
    assert_eq!(snapshot.state, PlaybackState::Idle);
    Ok(())
}

#[tokio::test]
async fn test_play_in_another_channel_moves_first() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    play(&t, "a").await?;
    play(&t, "b").await?;

    let outcome = t.handle.play(GUILD, Id::new(99), None, stream("c")).await?;
    assert_eq!(outcome, PlayOutcome::Started { title: "c.mp3".into() });

    let snapshot = t.handle.snapshot(GUILD).await?;
    assert_eq!(snapshot.voice_channel, Some(Id::new(99)));
    assert!(snapshot.queue.is_empty(), "old channel's queue was dropped");
    assert_eq!(t.transport.disconnect_count(GUILD), 1);
    Ok(())
}

#[tokio::test]
async fn test_being_disconnected_resets_the_session() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    play(&t, "a").await?;
    let generation = t.handle.snapshot(GUILD).await?.generation;

    // Our own channel echoed back: nothing changes.
    t.handle.voice_state_changed(GUILD, Some(VOICE));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(t.handle.snapshot(GUILD).await?.state, PlaybackState::Playing);

    t.handle.voice_state_changed(GUILD, None);
    assert!(
        eventually(Duration::from_secs(1), || async { t.transport.disconnect_count(GUILD) == 1 }).await
    );
    let snapshot = t.handle.snapshot(GUILD).await?;
    assert_eq!(snapshot.state, PlaybackState::Idle);
    assert!(snapshot.now_playing.is_none());

    // A new request starts a fresh session.
    play(&t, "b").await?;
    assert!(t.handle.snapshot(GUILD).await?.generation > generation);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_every_session() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    let other: Id<GuildMarker> = Id::new(2);
    play(&t, "a").await?;
    t.handle.play(other, Id::new(43), None, stream("x")).await?;

    t.handle.shutdown().await?;
    timeout(Duration::from_secs(1), t.task).await.expect("controller exits").expect("no panic");

    assert!(!t.transport.is_connected(GUILD));
    assert!(!t.transport.is_connected(other));
    let err = t.handle.snapshot(GUILD).await.unwrap_err();
    assert!(matches!(err, Error::Platform(_)));
    Ok(())
}

#[tokio::test]
async fn test_every_connect_waiter_gets_the_same_error() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    t.transport.gate_connects();
    t.transport.fail_connects("no route");

    let handle = t.handle.clone();
    let joining = tokio::spawn(async move { handle.join(GUILD, VOICE, None).await });
    wait_for_state(&t.handle, GUILD, PlaybackState::Connecting).await?;
    let handle = t.handle.clone();
    let playing = tokio::spawn(async move { handle.play(GUILD, VOICE, None, stream("a")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    t.transport.release_connect();

    let join_err = joining.await.expect("task").unwrap_err();
    let play_err = playing.await.expect("task").unwrap_err();
    for err in [join_err, play_err] {
        assert_eq!(err.to_string(), "Voice connection error: no route");
    }
    Ok(())
}

#[tokio::test]
async fn test_requests_are_admitted_in_ticket_order() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    let early = t.handle.ticket(GUILD);

    let handle = t.handle.clone();
    let late = tokio::spawn(async move { handle.play(GUILD, VOICE, None, stream("b")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.transport.connect_count(GUILD), 0, "waits for the earlier ticket");

    let outcome = t.handle.play_with(early, VOICE, None, stream("a")).await?;
    assert_eq!(outcome, PlayOutcome::Started { title: "a.mp3".into() });
    let late = late.await.expect("task")?;
    assert_eq!(late, PlayOutcome::Queued { title: "b.mp3".into(), position: 1 });
    assert_eq!(t.transport.played_sources(GUILD), vec![stream("a").source]);
    Ok(())
}

#[tokio::test]
async fn test_dropped_ticket_does_not_hold_up_later_requests() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    let early = t.handle.ticket(GUILD);

    let handle = t.handle.clone();
    let late = tokio::spawn(async move { handle.play(GUILD, VOICE, None, stream("b")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(early);

    let late = timeout(Duration::from_secs(1), late).await.expect("admitted").expect("task")?;
    assert_eq!(late, PlayOutcome::Started { title: "b.mp3".into() });
    Ok(())
}

#[tokio::test]
async fn test_stop_cancels_requests_still_being_prepared() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    let ticket = t.handle.ticket(GUILD);

    assert!(t.handle.stop(GUILD).await?, "an outstanding request counts as active");
    assert!(!ticket.is_current());
    let err = t.handle.play_with(ticket, VOICE, None, stream("a")).await.unwrap_err();
    assert!(matches!(err, Error::Superseded(_)), "{err:?}");
    assert_eq!(t.transport.connect_count(GUILD), 0);

    // Requests made after the stop are unaffected.
    assert_eq!(play(&t, "b").await?, PlayOutcome::Started { title: "b.mp3".into() });
    assert_eq!(t.transport.played_sources(GUILD), vec![stream("b").source]);
    Ok(())
}

#[tokio::test]
async fn test_stop_rejects_requests_waiting_their_turn() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    let early = t.handle.ticket(GUILD);

    let handle = t.handle.clone();
    let late = tokio::spawn(async move { handle.play(GUILD, VOICE, None, stream("b")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(t.handle.stop(GUILD).await?);
    let late = late.await.expect("task");
    assert!(matches!(late, Err(Error::Superseded(_))), "{late:?}");
    let early = t.handle.play_with(early, VOICE, None, stream("a")).await;
    assert!(matches!(early, Err(Error::Superseded(_))), "{early:?}");
    assert_eq!(t.transport.connect_count(GUILD), 0);
    Ok(())
}

#[tokio::test]
async fn test_losing_the_connection_cancels_prepared_requests() -> Result<(), Error> {
    let t = spawn_test_controller(settings());
    play(&t, "a").await?;
    let ticket = t.handle.ticket(GUILD);

    t.handle.voice_state_changed(GUILD, None);
    assert!(eventually(Duration::from_secs(1), || async { !ticket.is_current() }).await);

    let err = t.handle.play_with(ticket, VOICE, None, stream("b")).await.unwrap_err();
    assert!(matches!(err, Error::Superseded(_)), "{err:?}");
    assert_eq!(t.transport.played_sources(GUILD), vec![stream("a").source]);
    Ok(())
}
