//! Private streams and streams lost before their refresh completed.

use crate::mock_infrastructure::{
    bring_up, drain, harness, item_messages, item_request, service, statuses, Harness,
};
use tandem_core::{
    errors::SubmitError,
    group::{SubmitOptions, Submitted},
    types::{Domain, Envelope, MemberId, Origin, StandbyMode},
};

async fn two_members() -> Harness {
    let mut h = harness(StandbyMode::LoginBased, 2);
    bring_up(&mut h, &[vec![service(1, "ELEKTRON")], vec![service(1, "ELEKTRON")]]).await;
    h
}

/// Test a private stream is opened on the active only
#[tokio::test]
async fn test_private_stream_not_mirrored() {
    let mut h = two_members().await;

    let submitted = h
        .group
        .submit(item_request(7, "IBM.N"), SubmitOptions::service_name("ELEKTRON").private())
        .unwrap();

    assert_eq!(submitted, Submitted::Sent { targets: vec![MemberId(0)] });
    let sent = h.provider(0).requests_for(7);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].flags.private_stream);
    assert!(h.provider(1).requests_for(7).is_empty());
}

/// Test the private flag on the message itself is honoured
#[tokio::test]
async fn test_private_flag_on_envelope() {
    let mut h = two_members().await;

    h.group
        .submit(item_request(7, "IBM.N").private(), SubmitOptions::service_name("ELEKTRON"))
        .unwrap();
    assert!(h.provider(1).requests_for(7).is_empty());
}

/// Test losing a private stream's owner closes it with CLOSED_RECOVER and no resubmission
#[tokio::test]
async fn test_private_stream_closed_on_owner_loss() {
    let mut h = two_members().await;
    h.group
        .submit(item_request(7, "IBM.N"), SubmitOptions::service_name("ELEKTRON").private())
        .unwrap();
    h.provider(0).refresh(7);
    drain(&mut h.group).await;

    h.provider(0).kill("connection reset by peer");
    let events = drain(&mut h.group).await;

    let status = statuses(&events, 7);
    assert_eq!(status.len(), 1);
    assert!(status[0].is_closed_recover(), "expected CLOSED_RECOVER, got {:?}", status[0]);
    assert_eq!(item_messages(&events, 7)[0].origin, Origin::Group);
    assert!(h.provider(1).requests_for(7).is_empty(), "private streams are never resubmitted");
    assert_eq!(h.group.open_streams(), 0);
    assert_eq!(h.group.stats().resubmissions, 0);
}

/// Test a private request with no eligible owner is refused instead of queued
#[tokio::test]
async fn test_private_request_without_owner_refused() {
    let mut h = harness(StandbyMode::LoginBased, 2);
    h.group.connect();
    drain(&mut h.group).await;

    let result = h.group.submit(
        item_request(7, "IBM.N"),
        SubmitOptions::service_name("ELEKTRON").private(),
    );
    assert_eq!(result, Err(SubmitError::NoActiveMember(7)));
    assert_eq!(h.group.open_streams(), 0);
}

/// Test a shared stream whose refresh never completed is closed rather than resubmitted
#[tokio::test]
async fn test_incomplete_refresh_closed_on_owner_loss() {
    let mut h = two_members().await;
    h.group.submit(item_request(8, "GOOG.O"), SubmitOptions::service_name("ELEKTRON")).unwrap();
    h.provider(0).send(Envelope::refresh(Domain::MarketPrice, 8).partial());
    drain(&mut h.group).await;

    h.provider(0).kill("connection reset by peer");
    let events = drain(&mut h.group).await;

    let status = statuses(&events, 8);
    assert_eq!(status.len(), 1);
    assert!(status[0].is_closed_recover());
    assert_eq!(h.group.open_streams(), 0);
    assert_eq!(h.provider(1).requests_for(8).len(), 1, "only the original mirror request");
}

/// Test a shared request submitted before any member is ready waits and is sent on promotion
#[tokio::test]
async fn test_shared_request_queued_until_promotion() {
    let mut h = harness(StandbyMode::LoginBased, 2);
    h.group.connect();
    h.group.submit(Envelope::login_request("trader"), SubmitOptions::default()).unwrap();
    drain(&mut h.group).await;

    let queued = h.group.submit(item_request(5, "IBM.N"), SubmitOptions::default()).unwrap();
    assert_eq!(queued, Submitted::Queued);
    assert!(h.provider(0).requests_for(5).is_empty());

    h.provider(0).respond_login();
    drain(&mut h.group).await;
    assert_eq!(h.provider(0).requests_for(5).len(), 1, "sent once member-0 is promoted");

    h.provider(1).respond_login();
    drain(&mut h.group).await;
    assert!(h.provider(1).requests_for(5).is_empty(), "member-1 directory still outstanding");

    h.provider(0).send_directory_refresh(vec![service(1, "ELEKTRON")]);
    h.provider(1).send_directory_refresh(vec![service(1, "ELEKTRON")]);
    drain(&mut h.group).await;
    assert_eq!(h.provider(1).requests_for(5).len(), 1, "mirrored once member-1 has answered");
}

/// Test a private stream on a service the session active lacks is refused, not sent to a standby
#[tokio::test]
async fn test_private_stream_never_goes_to_standby() {
    let mut h = harness(StandbyMode::LoginBased, 2);
    bring_up(
        &mut h,
        &[vec![service(1, "ELEKTRON")], vec![service(1, "ELEKTRON"), service(2, "IDN")]],
    )
    .await;

    let result = h.group.submit(item_request(7, "IBM.N"), SubmitOptions::service_id(2).private());
    assert_eq!(result, Err(SubmitError::NoActiveMember(7)));
    assert!(h.provider(0).requests_for(7).is_empty());
    assert!(h.provider(1).requests_for(7).is_empty());
    assert_eq!(h.group.open_streams(), 0);

    let shared = h.group.submit(item_request(8, "IBM.N"), SubmitOptions::service_id(2));
    assert_eq!(shared, Ok(Submitted::Sent { targets: vec![MemberId(1)] }));
}
