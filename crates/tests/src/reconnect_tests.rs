//! Member reconnection, reconnect budgets and channel-level state transitions.
//!
//! Timing tests run on a paused clock so backoff delays elapse instantly.

use crate::mock_infrastructure::{
    bring_up, channel_events, drain, fast_reconnect, harness, harness_with, item_messages,
    item_request, lifecycle, login_messages, run_for, service, statuses,
};
use std::time::Duration;
use tandem_core::{
    errors::SubmitError,
    group::{ChannelState, MemberState, ScopeKey, SubmitOptions},
    types::{ChannelEvent, Envelope, MemberId, StandbyMode},
};

/// Test the channel reports DOWN_RECONNECTING then UP and READY again after a reconnect
#[tokio::test(start_paused = true)]
async fn test_single_member_reconnects() {
    let mut h = harness(StandbyMode::LoginBased, 1);
    bring_up(&mut h, &[vec![service(1, "ELEKTRON")]]).await;
    h.group.submit(item_request(5, "IBM.N"), SubmitOptions::default()).unwrap();
    h.provider(0).refresh(5);
    drain(&mut h.group).await;

    h.provider(0).kill("connection reset by peer");
    let mut events = drain(&mut h.group).await;
    assert_eq!(lifecycle(&events), vec![ChannelEvent::DownReconnecting]);
    assert!(statuses(&events, 5)[0].is_open_suspect());
    let login = login_messages(&events);
    assert_eq!(login.len(), 1, "login goes suspect once");
    assert!(login[0].envelope.status.as_ref().is_some_and(|s| s.is_open_suspect()));

    events = run_for(&mut h.group, Duration::from_millis(150)).await;
    assert_eq!(lifecycle(&events), vec![ChannelEvent::Up]);
    assert_eq!(h.provider(0).connect_count(), 2);

    h.provider(0).respond_login();
    events = drain(&mut h.group).await;
    h.provider(0).send_directory_refresh(vec![service(1, "ELEKTRON")]);
    events.extend(drain(&mut h.group).await);

    assert_eq!(lifecycle(&events), vec![ChannelEvent::Ready]);
    assert_eq!(login_messages(&events).len(), 1, "fresh login refresh after recovery");
    assert_eq!(h.provider(0).requests_for(5).len(), 2, "stream resubmitted after recovery");
    assert_eq!(h.group.stats().resubmissions, 1);

    h.provider(0).refresh(5);
    assert_eq!(item_messages(&drain(&mut h.group).await, 5).len(), 1);
}

/// Test the socket set swaps the old descriptor for the new one
#[tokio::test(start_paused = true)]
async fn test_socket_set_follows_reconnect() {
    let mut h = harness(StandbyMode::LoginBased, 1);
    bring_up(&mut h, &[vec![service(1, "ELEKTRON")]]).await;
    let before = h.provider(0).descriptor().unwrap();

    h.provider(0).kill("connection reset by peer");
    let events = drain(&mut h.group).await;
    let removed = channel_events(&events).into_iter().find_map(|e| match e {
        ChannelEvent::SocketSetChanged(diff) => Some(diff),
        _ => None,
    });
    let removed = removed.expect("descriptor removal published");
    assert_eq!(removed.removed, vec![before]);
    assert!(h.group.descriptors().is_empty());

    run_for(&mut h.group, Duration::from_millis(150)).await;
    let after = h.provider(0).descriptor().unwrap();
    assert_ne!(before, after);
    assert_eq!(h.group.descriptors(), vec![after]);
}

/// Test exhausting the reconnect budget takes the channel DOWN and closes streams
#[tokio::test(start_paused = true)]
async fn test_budget_exhaustion_takes_channel_down() {
    let mut h = harness_with(StandbyMode::LoginBased, 1, |b| b.reconnect(fast_reconnect(2)));
    bring_up(&mut h, &[vec![service(1, "ELEKTRON")]]).await;
    h.group.submit(item_request(5, "IBM.N"), SubmitOptions::default()).unwrap();
    h.provider(0).refresh(5);
    drain(&mut h.group).await;

    h.provider(0).refuse_connections(true);
    h.provider(0).kill("connection reset by peer");
    let mut events = drain(&mut h.group).await;
    events.extend(run_for(&mut h.group, Duration::from_secs(5)).await);

    assert_eq!(
        lifecycle(&events),
        vec![ChannelEvent::DownReconnecting, ChannelEvent::Down],
        "DOWN is reported exactly once"
    );
    assert_eq!(h.provider(0).connect_count(), 3, "initial connect plus two retries");
    assert_eq!(h.group.stats().reconnect_attempts, 2);
    assert_eq!(h.group.channel_state(), ChannelState::Down);
    assert_eq!(h.group.member_state(MemberId(0)), Some(MemberState::Down));

    let status = statuses(&events, 5);
    assert_eq!(status.len(), 2);
    assert!(status[0].is_open_suspect());
    assert!(status[1].is_closed_recover());
    assert_eq!(h.group.open_streams(), 0);

    let after = h.group.submit(item_request(6, "MSFT.O"), SubmitOptions::default());
    assert_eq!(after, Err(SubmitError::GroupDown));
}

/// Test reconnect delays double from the minimum
#[tokio::test(start_paused = true)]
async fn test_backoff_doubles() {
    let mut h = harness(StandbyMode::LoginBased, 1);
    bring_up(&mut h, &[vec![service(1, "ELEKTRON")]]).await;

    h.provider(0).refuse_connections(true);
    h.provider(0).kill("connection reset by peer");
    drain(&mut h.group).await;

    // retries at 100ms, 300ms and 700ms; the next is due at 1500ms
    run_for(&mut h.group, Duration::from_millis(1_000)).await;
    assert_eq!(h.provider(0).connect_count(), 4);
    assert_eq!(h.group.member_statuses()[0].consecutive_failures, 4);
    assert_eq!(h.group.channel_state(), ChannelState::DownReconnecting);
}

/// Test a refused initial connect on one member does not flap the channel
#[tokio::test(start_paused = true)]
async fn test_initial_refusal_with_live_peer() {
    let mut h = harness(StandbyMode::LoginBased, 2);
    h.provider(0).refuse_connections(true);

    let events = bring_up(&mut h, &[vec![], vec![service(1, "ELEKTRON")]]).await;

    assert_eq!(lifecycle(&events), vec![ChannelEvent::Up, ChannelEvent::Ready]);
    assert_eq!(h.group.member_state(MemberId(0)), Some(MemberState::DownReconnecting));
    assert_eq!(h.group.active_member(ScopeKey::Session), Some(MemberId(1)));
}

/// Test every initial connect failing with no budget reports DOWN straight away
#[tokio::test(start_paused = true)]
async fn test_initial_refusal_without_budget() {
    let mut h = harness_with(StandbyMode::LoginBased, 2, |b| b.reconnect(fast_reconnect(0)));
    h.provider(0).refuse_connections(true);
    h.provider(1).refuse_connections(true);

    h.group.connect();
    let events = drain(&mut h.group).await;

    assert_eq!(lifecycle(&events), vec![ChannelEvent::Down]);
    assert_eq!(h.group.channel_state(), ChannelState::Down);
}

/// Test a login that never gets an answer times out and the member reconnects
#[tokio::test(start_paused = true)]
async fn test_login_timeout_triggers_reconnect() {
    let mut h = harness(StandbyMode::LoginBased, 1);
    h.group.connect();
    h.group.submit(Envelope::login_request("trader"), SubmitOptions::default()).unwrap();
    drain(&mut h.group).await;

    let events = run_for(&mut h.group, Duration::from_millis(5_050)).await;

    assert_eq!(lifecycle(&events), vec![ChannelEvent::DownReconnecting]);
    assert_eq!(h.group.member_state(MemberId(0)), Some(MemberState::DownReconnecting));

    run_for(&mut h.group, Duration::from_millis(100)).await;
    assert_eq!(h.provider(0).connect_count(), 2);
    assert_eq!(h.group.member_state(MemberId(0)), Some(MemberState::Up));
}

/// Test a member whose login is rejected is not retried while its peer carries the session
#[tokio::test(start_paused = true)]
async fn test_login_rejection_is_terminal_for_member() {
    let mut h = harness(StandbyMode::LoginBased, 2);
    h.group.connect();
    h.group.submit(Envelope::login_request("trader"), SubmitOptions::default()).unwrap();
    drain(&mut h.group).await;

    h.provider(0).reject_login("user not entitled");
    h.provider(1).respond_login();
    drain(&mut h.group).await;
    run_for(&mut h.group, Duration::from_secs(2)).await;

    assert_eq!(h.group.member_state(MemberId(0)), Some(MemberState::Down));
    assert_eq!(h.provider(0).connect_count(), 1);
    assert_eq!(h.group.active_member(ScopeKey::Session), Some(MemberId(1)));
    assert!(!h.group.channel_state().is_down());
}

/// Test an explicit close drops every link without channel events or reconnects
#[tokio::test]
async fn test_closed_group_stays_quiet() {
    let mut h = harness(StandbyMode::LoginBased, 2);
    bring_up(&mut h, &[vec![service(1, "ELEKTRON")], vec![service(1, "ELEKTRON")]]).await;

    h.group.close();
    let events = drain(&mut h.group).await;

    assert!(lifecycle(&events).is_empty(), "explicit close emits no channel event");
    assert!(!h.provider(0).is_connected());
    assert!(!h.provider(1).is_connected());
    assert_eq!(h.provider(0).connect_count(), 1);
    assert_eq!(h.group.channel_state(), ChannelState::Down);
    assert_eq!(
        h.group.submit(item_request(5, "IBM.N"), SubmitOptions::default()),
        Err(SubmitError::GroupDown)
    );
}
