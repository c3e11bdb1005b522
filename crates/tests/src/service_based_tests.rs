//! Service-based warm standby: ownership is decided per service.

use crate::mock_infrastructure::{
    bring_up, drain, from_member, harness, item_messages, item_request, lifecycle, service,
    statuses, Harness,
};
use tandem_core::{
    errors::SubmitError,
    group::{ScopeKey, SubmitOptions, Submitted},
    types::{
        ChannelEvent, Domain, MemberId, MsgClass, Role, RoleNotice, ServiceEntry, ServiceState,
        StandbyMode,
    },
};

const SERVICE_A: u16 = 10;
const SERVICE_B: u16 = 20;

/// member-0 reports only service A, member-1 only service B.
async fn split_services() -> Harness {
    let mut h = harness(StandbyMode::ServiceBased, 2);
    bring_up(&mut h, &[vec![service(SERVICE_A, "FEED_A")], vec![service(SERVICE_B, "FEED_B")]])
        .await;
    h
}

/// Both members report both services.
async fn shared_services() -> Harness {
    let mut h = harness(StandbyMode::ServiceBased, 2);
    let both = vec![service(SERVICE_A, "FEED_A"), service(SERVICE_B, "FEED_B")];
    bring_up(&mut h, &[both.clone(), both]).await;
    h
}

/// Test each service gets its own active member
#[tokio::test]
async fn test_services_owned_independently() {
    let h = split_services().await;

    assert_eq!(h.group.active_member(ScopeKey::Service(SERVICE_A)), Some(MemberId(0)));
    assert_eq!(h.group.active_member(ScopeKey::Service(SERVICE_B)), Some(MemberId(1)));
    assert_eq!(h.group.active_member(ScopeKey::Session), None);

    let notice_a: Vec<_> = h
        .provider(0)
        .received_of(MsgClass::Generic, Domain::Source)
        .into_iter()
        .filter_map(|e| e.role)
        .collect();
    assert_eq!(notice_a, vec![RoleNotice::Services(vec![(SERVICE_A, Role::Active)])]);
}

/// Test items on different services route to different members and refresh independently
#[tokio::test]
async fn test_items_route_per_service() {
    let mut h = split_services().await;

    let a = h.group.submit(item_request(5, "A.ITEM"), SubmitOptions::service_name("FEED_A"));
    let b = h.group.submit(item_request(6, "B.ITEM"), SubmitOptions::service_id(SERVICE_B));
    assert_eq!(a, Ok(Submitted::Sent { targets: vec![MemberId(0)] }));
    assert_eq!(b, Ok(Submitted::Sent { targets: vec![MemberId(1)] }));
    assert!(h.provider(1).requests_for(5).is_empty());
    assert!(h.provider(0).requests_for(6).is_empty());

    h.provider(1).refresh(6);
    h.provider(0).refresh(5);
    let events = drain(&mut h.group).await;

    let on_a = item_messages(&events, 5);
    let on_b = item_messages(&events, 6);
    assert_eq!(on_a.len(), 1);
    assert_eq!(on_b.len(), 1);
    assert!(from_member(&on_a[0], 0));
    assert!(from_member(&on_b[0], 1));
}

/// Test losing one service's owner leaves the other service untouched
#[tokio::test]
async fn test_owner_loss_confined_to_its_services() {
    let mut h = split_services().await;
    h.group.submit(item_request(5, "A.ITEM"), SubmitOptions::service_id(SERVICE_A)).unwrap();
    h.group.submit(item_request(6, "B.ITEM"), SubmitOptions::service_id(SERVICE_B)).unwrap();
    h.provider(0).refresh(5);
    h.provider(1).refresh(6);
    drain(&mut h.group).await;

    h.provider(0).kill("connection reset by peer");
    let events = drain(&mut h.group).await;

    let status_a = statuses(&events, 5);
    assert_eq!(status_a.len(), 1);
    assert!(status_a[0].is_open_suspect(), "stream waits for a new owner of service A");
    assert!(statuses(&events, 6).is_empty());
    assert_eq!(h.group.active_member(ScopeKey::Service(SERVICE_A)), None);
    assert_eq!(h.group.active_member(ScopeKey::Service(SERVICE_B)), Some(MemberId(1)));
    assert!(!lifecycle(&events).contains(&ChannelEvent::DownReconnecting));

    h.provider(1).update(6, b"last=20.5");
    let delivered = item_messages(&drain(&mut h.group).await, 6);
    assert_eq!(delivered.len(), 1);
}

/// Test a service DOWN on its owner moves that service to the standby only
#[tokio::test]
async fn test_service_down_moves_one_scope() {
    let mut h = shared_services().await;
    assert_eq!(h.group.active_member(ScopeKey::Service(SERVICE_A)), Some(MemberId(0)));
    assert_eq!(h.group.active_member(ScopeKey::Service(SERVICE_B)), Some(MemberId(0)));

    h.group.submit(item_request(5, "A.ITEM"), SubmitOptions::service_id(SERVICE_A)).unwrap();
    h.group.submit(item_request(6, "B.ITEM"), SubmitOptions::service_id(SERVICE_B)).unwrap();
    assert_eq!(h.provider(1).requests_for(5).len(), 1, "standby of service A mirrors the item");
    h.provider(0).refresh(5);
    h.provider(0).refresh(6);
    drain(&mut h.group).await;

    h.provider(0).send_directory_update(vec![ServiceEntry::update(SERVICE_A, ServiceState::Down)]);
    let events = drain(&mut h.group).await;

    assert_eq!(h.group.active_member(ScopeKey::Service(SERVICE_A)), Some(MemberId(1)));
    assert_eq!(h.group.active_member(ScopeKey::Service(SERVICE_B)), Some(MemberId(0)));
    assert_eq!(statuses(&events, 5).len(), 1);
    assert!(statuses(&events, 6).is_empty());
    assert_eq!(h.provider(1).requests_for(5).len(), 2);

    let notices: Vec<_> = h
        .provider(1)
        .received_of(MsgClass::Generic, Domain::Source)
        .into_iter()
        .filter_map(|e| e.role)
        .collect();
    assert_eq!(
        notices.last(),
        Some(&RoleNotice::Services(vec![(SERVICE_A, Role::Active)])),
        "only the moved service is renotified"
    );

    h.provider(1).refresh(5);
    let delivered = item_messages(&drain(&mut h.group).await, 5);
    assert_eq!(delivered.len(), 1);
    assert!(from_member(&delivered[0], 1));
}

/// Test an item naming a service nobody has announced yet waits for the directory
#[tokio::test]
async fn test_item_waits_for_unknown_service_name() {
    let mut h = split_services().await;

    let queued =
        h.group.submit(item_request(7, "C.ITEM"), SubmitOptions::service_name("FEED_C")).unwrap();
    assert_eq!(queued, Submitted::Queued);

    h.provider(1).send_directory_update(vec![service(30, "FEED_C")]);
    drain(&mut h.group).await;

    let sent = h.provider(1).requests_for(7);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].service_id, Some(30));
}

/// Test an item with no service at all is refused
#[tokio::test]
async fn test_item_without_service_rejected() {
    let mut h = split_services().await;

    let result = h.group.submit(item_request(8, "X"), SubmitOptions::default());
    assert!(matches!(result, Err(SubmitError::InvalidMessage(_))));
    assert_eq!(h.group.open_streams(), 0);
}
