//! Generic messages, posts, closes and requests the group refuses.

use crate::mock_infrastructure::{
    bring_up, drain, harness, item_messages, item_request, service, Harness,
};
use tandem_core::{
    errors::SubmitError,
    group::{SubmitOptions, Submitted},
    types::{Domain, Envelope, MemberId, MsgClass, StandbyMode},
};

async fn login_based() -> Harness {
    let mut h = harness(StandbyMode::LoginBased, 2);
    bring_up(&mut h, &[vec![service(1, "ELEKTRON")], vec![service(1, "ELEKTRON")]]).await;
    h
}

/// Test a generic message reaches every member holding a session in login-based mode
#[tokio::test]
async fn test_generic_broadcast_login_based() {
    let mut h = login_based().await;
    h.group.submit(item_request(5, "IBM.N"), SubmitOptions::service_name("ELEKTRON")).unwrap();

    let submitted =
        h.group.submit(Envelope::generic(Domain::MarketPrice, 5), SubmitOptions::default());
    assert_eq!(submitted, Ok(Submitted::Sent { targets: vec![MemberId(0), MemberId(1)] }));
    for member in 0..2 {
        let generics = h.provider(member).received_of(MsgClass::Generic, Domain::MarketPrice);
        assert_eq!(generics.len(), 1, "member {member}");
    }
}

/// Test an off-stream post on the login stream uses each member's own login stream
#[tokio::test]
async fn test_login_post_broadcast() {
    let mut h = login_based().await;

    let submitted = h.group.submit(Envelope::post(Domain::Login, 1), SubmitOptions::default());
    assert_eq!(submitted, Ok(Submitted::Sent { targets: vec![MemberId(0), MemberId(1)] }));

    for member in 0..2 {
        let login = h.provider(member).received_of(MsgClass::Request, Domain::Login);
        let posts = h.provider(member).received_of(MsgClass::Post, Domain::Login);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].stream_id, login[0].stream_id);
    }
}

/// Test a generic message in service-based mode goes to the service owner only
#[tokio::test]
async fn test_generic_directed_service_based() {
    let mut h = harness(StandbyMode::ServiceBased, 2);
    let both = vec![service(1, "FEED_A"), service(2, "FEED_B")];
    bring_up(&mut h, &[both.clone(), both]).await;

    let submitted =
        h.group.submit(Envelope::generic(Domain::MarketPrice, 5), SubmitOptions::service_id(2));
    assert_eq!(submitted, Ok(Submitted::Sent { targets: vec![MemberId(0)] }));
    assert!(h.provider(1).received_of(MsgClass::Generic, Domain::MarketPrice).is_empty());

    let orphan =
        h.group.submit(Envelope::generic(Domain::MarketPrice, 6), SubmitOptions::service_id(99));
    assert_eq!(orphan, Err(SubmitError::NoActiveMember(6)));
}

/// Test a generic message with no member up is refused
#[tokio::test]
async fn test_generic_before_any_member_up() {
    let mut h = harness(StandbyMode::LoginBased, 2);
    h.provider(0).hold_establish(true);
    h.provider(1).hold_establish(true);
    h.group.connect();
    drain(&mut h.group).await;

    let result =
        h.group.submit(Envelope::generic(Domain::MarketPrice, 5), SubmitOptions::default());
    assert_eq!(result, Err(SubmitError::NotReady));
}

/// Test pause is refused on open and on reissue
#[tokio::test]
async fn test_pause_rejected() {
    let mut h = login_based().await;

    let open = h.group.submit(item_request(5, "IBM.N").paused(), SubmitOptions::default());
    assert_eq!(open, Err(SubmitError::PauseNotSupported(5)));
    assert_eq!(h.group.open_streams(), 0);

    h.group.submit(item_request(5, "IBM.N"), SubmitOptions::default()).unwrap();
    let reissue = h.group.submit(item_request(5, "IBM.N").paused(), SubmitOptions::default());
    assert_eq!(reissue, Err(SubmitError::PauseNotSupported(5)));
    assert_eq!(h.provider(0).requests_for(5).len(), 1, "pause never reaches a member");
}

/// Test a reissue goes to every member holding the stream
#[tokio::test]
async fn test_reissue_reaches_owner_and_mirror() {
    let mut h = login_based().await;
    h.group.submit(item_request(5, "IBM.N"), SubmitOptions::default()).unwrap();

    let reissue = h.group.submit(item_request(5, "IBM.N"), SubmitOptions::default());
    assert_eq!(reissue, Ok(Submitted::Sent { targets: vec![MemberId(0), MemberId(1)] }));
    assert_eq!(h.provider(0).requests_for(5).len(), 2);
    assert_eq!(h.provider(1).requests_for(5).len(), 2);
    assert_eq!(h.group.open_streams(), 1);
}

/// Test closing a stream closes every copy and later provider traffic is dropped
#[tokio::test]
async fn test_close_stream() {
    let mut h = login_based().await;
    h.group.submit(item_request(5, "IBM.N"), SubmitOptions::default()).unwrap();

    let closed = h.group.submit(Envelope::close(Domain::MarketPrice, 5), SubmitOptions::default());
    assert_eq!(closed, Ok(Submitted::Sent { targets: vec![MemberId(0), MemberId(1)] }));
    assert_eq!(h.group.open_streams(), 0);
    for member in 0..2 {
        assert_eq!(h.provider(member).received_of(MsgClass::Close, Domain::MarketPrice).len(), 1);
    }

    h.provider(0).refresh(5);
    assert!(item_messages(&drain(&mut h.group).await, 5).is_empty());

    let again = h.group.submit(Envelope::close(Domain::MarketPrice, 5), SubmitOptions::default());
    assert_eq!(again, Err(SubmitError::UnknownStream(5)));
}

/// Test a snapshot finished by the owner releases the standby's copy
#[tokio::test]
async fn test_snapshot_releases_mirrors() {
    let mut h = login_based().await;
    h.group.submit(item_request(9, "IBM.N").snapshot(), SubmitOptions::default()).unwrap();

    h.provider(0).refresh(9);
    let delivered = item_messages(&drain(&mut h.group).await, 9);

    assert_eq!(delivered.len(), 1);
    assert_eq!(h.group.open_streams(), 0);
    let closes = h.provider(1).received_of(MsgClass::Close, Domain::MarketPrice);
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].stream_id, 9);
}

/// Test message classes only providers send are refused
#[tokio::test]
async fn test_provider_only_classes_rejected() {
    let mut h = login_based().await;

    let result =
        h.group.submit(Envelope::refresh(Domain::MarketPrice, 5), SubmitOptions::default());
    assert!(matches!(result, Err(SubmitError::InvalidMessage(_))));
}
