//! Tests for transfer validation, queueing and manager bookkeeping.

mod common;

use std::path::PathBuf;

use common::{
    create_temp_dir, create_test_file, expect_download, offer_upload, random_bytes, test_config,
    Peer, CONNECTION, LOOPBACK,
};
use ircdcc_core::error::ErrorKind;
use ircdcc_core::manager::TransferEvent;
use ircdcc_core::protocol::DccMessage;
use ircdcc_core::transfer::{Direction, TransferStatus};

/// Queueing twice, or outside `Configuring`, changes nothing.
#[tokio::test]
async fn test_queue_is_idempotent() {
    let dir = create_temp_dir();
    let mut bob = Peer::new("bob", test_config(dir.path()));
    let id = expect_download(&mut bob, "alice", "a.txt", 5000, 10);

    assert!(!bob.manager.queue(id));
    bob.drain_updates();
    let queued: Vec<_> = bob
        .changes
        .iter()
        .filter(|c| c.new == TransferStatus::Queued)
        .collect();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].old, TransferStatus::Configuring);
    assert!(bob.changes.iter().all(|c| c.old != c.new));
}

/// Registration, queueing and removal are announced in order.
#[tokio::test]
async fn test_manager_notifications() {
    let dir = create_temp_dir();
    let mut bob = Peer::new("bob", test_config(dir.path()));
    let id = expect_download(&mut bob, "alice", "a.txt", 5000, 10);
    bob.manager.abort(id);

    let mut events = Vec::new();
    while let Ok(event) = bob.updates.try_recv() {
        events.push(event);
    }
    assert!(matches!(
        events.first(),
        Some(TransferEvent::Added { id: added, direction: Direction::Receive }) if *added == id
    ));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TransferEvent::Queued { .. }))
            .count(),
        1
    );
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Finished(snapshot)) if snapshot.status == TransferStatus::Aborted
    ));
    assert!(bob.manager.download(id).is_none(), "finished transfers are removed");
}

/// Offers that cannot be honored fail at queue time with a reason.
#[tokio::test]
async fn test_download_validation() {
    let dir = create_temp_dir();
    let mut bob = Peer::new("bob", test_config(dir.path()));

    let zero = bob.manager.new_download();
    {
        let d = bob.manager.download_mut(zero).expect("download");
        d.info_mut().set_connection_id(CONNECTION);
        d.info_mut().set_partner_nick("alice");
        d.set_partner_ip(LOOPBACK);
        d.set_partner_port(5000);
        d.set_file_name("empty");
    }
    assert!(!bob.manager.queue(zero));

    let unspecified = bob.manager.new_download();
    {
        let d = bob.manager.download_mut(unspecified).expect("download");
        d.info_mut().set_connection_id(CONNECTION);
        d.info_mut().set_partner_nick("alice");
        d.set_partner_ip("0.0.0.0".parse().expect("ip"));
        d.set_partner_port(5000);
        d.set_file_size(10);
    }
    assert!(!bob.manager.queue(unspecified));

    let anonymous = bob.manager.new_download();
    {
        let d = bob.manager.download_mut(anonymous).expect("download");
        d.info_mut().set_connection_id(CONNECTION);
        d.set_partner_ip(LOOPBACK);
        d.set_partner_port(5000);
        d.set_file_size(10);
    }
    assert!(!bob.manager.queue(anonymous));

    bob.drain_updates();
    let detail = |id| {
        bob.finished(id)
            .map(|s| (s.status, s.status_detail.clone(), s.failure_kind))
            .expect("finished")
    };
    assert_eq!(
        detail(zero),
        (
            TransferStatus::Failed,
            "Unsupported negotiation (filesize=0)".to_string(),
            Some(ErrorKind::PolicyRejection)
        )
    );
    assert_eq!(detail(unspecified).1, "Invalid sender address (0.0.0.0)");
    assert_eq!(detail(anonymous).1, "No partner nick was given");
}

/// Receiving can be forbidden by policy.
#[tokio::test]
async fn test_receiving_not_authorized() {
    let dir = create_temp_dir();
    let mut config = test_config(dir.path());
    config.policy.allow_receiving = false;
    let mut bob = Peer::new("bob", config);

    let id = bob.manager.new_download();
    {
        let d = bob.manager.download_mut(id).expect("download");
        d.info_mut().set_connection_id(CONNECTION);
        d.info_mut().set_partner_nick("alice");
        d.set_partner_ip(LOOPBACK);
        d.set_partner_port(5000);
        d.set_file_size(10);
    }
    assert!(!bob.manager.queue(id));
    bob.drain_updates();
    assert_eq!(
        bob.finished(id).map(|s| s.status_detail.as_str()),
        Some("The admin has restricted the right to receive files")
    );
}

/// Upload validation: missing and empty sources, and policy.
#[tokio::test]
async fn test_upload_validation() {
    let dir = create_temp_dir();
    let empty = create_test_file(dir.path(), "empty.txt", b"");
    let mut alice = Peer::new("alice", test_config(dir.path()));

    let missing = alice.manager.new_upload();
    {
        let u = alice.manager.upload_mut(missing).expect("upload");
        u.info_mut().set_connection_id(CONNECTION);
        u.info_mut().set_partner_nick("bob");
        u.set_file_path(dir.path().join("nope.txt"));
    }
    assert!(!alice.manager.queue(missing));

    let zero = alice.manager.new_upload();
    {
        let u = alice.manager.upload_mut(zero).expect("upload");
        u.info_mut().set_connection_id(CONNECTION);
        u.info_mut().set_partner_nick("bob");
        u.set_file_path(empty);
    }
    assert!(!alice.manager.queue(zero));

    alice.drain_updates();
    assert_eq!(
        alice.finished(missing).map(|s| s.failure_kind),
        Some(Some(ErrorKind::PolicyRejection))
    );
    assert_eq!(
        alice.finished(zero).map(|s| s.status_detail.as_str()),
        Some("Unable to send a 0 byte file.")
    );

    let mut config = test_config(dir.path());
    config.policy.allow_sending = false;
    let mut restricted = Peer::new("alice", config);
    let source = create_test_file(dir.path(), "ok.txt", b"hello");
    let id = restricted.manager.new_upload();
    {
        let u = restricted.manager.upload_mut(id).expect("upload");
        u.info_mut().set_connection_id(CONNECTION);
        u.info_mut().set_partner_nick("bob");
        u.set_file_path(source);
    }
    assert!(!restricted.manager.queue(id));
    restricted.drain_updates();
    assert_eq!(
        restricted.finished(id).map(|s| s.status_detail.as_str()),
        Some("The admin has restricted the right to send files")
    );
}

/// Upload names are normalized and the size comes from the file.
#[tokio::test]
async fn test_upload_name_normalization() {
    let dir = create_temp_dir();
    let content = random_bytes(123);
    let source = create_test_file(dir.path(), "my \"best\" song.mp3", &content);
    let mut config = test_config(dir.path());
    config.transfer.space_to_underscore = true;
    let mut alice = Peer::new("alice", config);

    let id = offer_upload(&mut alice, "bob", &source);
    let info = alice.manager.upload(id).expect("upload").info();
    assert_eq!(info.file_name(), "my__best__song.mp3");
    assert_eq!(info.file_size(), 123);
    assert_eq!(info.own_ip(), Some(LOOPBACK));
}

/// A size given before queueing is announced as is; the source must
/// still exist.
#[tokio::test]
async fn test_upload_keeps_given_size() {
    let dir = create_temp_dir();
    let source = create_test_file(dir.path(), "head.bin", &random_bytes(1000));
    let mut alice = Peer::new("alice", test_config(dir.path()));

    let id = alice.manager.new_upload();
    {
        let u = alice.manager.upload_mut(id).expect("upload");
        u.info_mut().set_connection_id(CONNECTION);
        u.info_mut().set_partner_nick("bob");
        u.set_file_path(source);
        assert!(u.set_file_size(600));
    }
    assert!(alice.manager.queue(id));
    assert_eq!(
        alice.manager.upload(id).map(|u| u.info().file_size()),
        Some(600)
    );

    let gone = alice.manager.new_upload();
    {
        let u = alice.manager.upload_mut(gone).expect("upload");
        u.info_mut().set_connection_id(CONNECTION);
        u.info_mut().set_partner_nick("bob");
        u.set_file_path(dir.path().join("gone.bin"));
        assert!(u.set_file_size(600));
    }
    assert!(!alice.manager.queue(gone));
    alice.drain_updates();
    assert_eq!(
        alice.finished(gone).map(|s| s.status),
        Some(TransferStatus::Failed)
    );
}

/// Inbound offers land under the partner folder when configured.
#[tokio::test]
async fn test_offer_default_destination() {
    let dir = create_temp_dir();
    let mut config = test_config(dir.path());
    config.general.create_partner_folder = true;
    config.general.add_partner_prefix = true;
    let mut bob = Peer::new("bob", config);

    let offer = DccMessage::Send {
        file_name: "../../etc/passwd".to_string(),
        address: LOOPBACK,
        port: 5000,
        size: 10,
        token: None,
    };
    let id = bob
        .manager
        .handle_message(CONNECTION, "alice", &offer)
        .expect("offer")
        .expect("download");

    let recv = bob.manager.download(id).expect("download");
    assert_eq!(recv.info().status(), TransferStatus::Queued);
    assert_eq!(
        recv.info().file_path(),
        Some(dir.path().join("alice").join("alice.passwd").as_path())
    );
}

/// Changing the download folder moves queued downloads that used the
/// default, and leaves explicit destinations alone.
#[tokio::test]
async fn test_default_incoming_folder_update() {
    let dir = create_temp_dir();
    let mut bob = Peer::new("bob", test_config(dir.path()));
    let default = expect_download(&mut bob, "alice", "a.txt", 5000, 10);

    let custom_path = PathBuf::from("/srv/custom/b.txt");
    let custom = bob.manager.new_download();
    {
        let d = bob.manager.download_mut(custom).expect("download");
        d.info_mut().set_connection_id(CONNECTION);
        d.info_mut().set_partner_nick("alice");
        d.set_partner_ip(LOOPBACK);
        d.set_partner_port(5000);
        d.set_file_name("b.txt");
        d.set_file_size(10);
        d.set_file_path(custom_path.clone());
    }
    assert!(bob.manager.queue(custom));

    let moved = create_temp_dir();
    bob.manager
        .set_default_incoming_folder(moved.path().to_path_buf());

    assert_eq!(
        bob.manager
            .download(default)
            .and_then(|d| d.info().file_path().map(PathBuf::from)),
        Some(moved.path().join("a.txt"))
    );
    assert_eq!(
        bob.manager
            .download(custom)
            .and_then(|d| d.info().file_path().map(PathBuf::from)),
        Some(custom_path)
    );
    assert_eq!(
        bob.manager.config().general.download_dir.as_deref(),
        Some(moved.path())
    );
}

/// Activity checks only count connecting or transferring work.
#[tokio::test]
async fn test_activity_queries() {
    let dir = create_temp_dir();
    let mut bob = Peer::new("bob", test_config(dir.path()));
    let id = expect_download(&mut bob, "alice", "a.txt", 5000, 10);

    assert!(!bob.manager.has_active_transfers());
    let path = bob
        .manager
        .download(id)
        .and_then(|d| d.info().file_path().map(PathBuf::from))
        .expect("path");
    assert!(!bob.manager.is_local_file_in_writing_process(&path));

    bob.manager.abort_all();
    bob.drain_updates();
    assert!(bob.manager.download(id).is_none());
    assert_eq!(bob.finished.len(), 1);
}

/// A second download to a path being written is held back with a question.
#[tokio::test]
async fn test_same_destination_in_use() {
    let dir = create_temp_dir();
    let listener = std::net::TcpListener::bind((LOOPBACK, 0)).expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let mut bob = Peer::new("bob", test_config(dir.path()));
    let first = expect_download(&mut bob, "alice", "same.bin", port, 1000);
    let second = expect_download(&mut bob, "carol", "same.bin", port, 1000);

    bob.manager.start(first);
    bob.run_until("first connecting", |p| {
        p.manager.download(first).map(|d| d.info().status()) == Some(TransferStatus::Connecting)
            || p.manager.download(first).map(|d| d.info().status())
                == Some(TransferStatus::Transferring)
    })
    .await;
    let path = dir.path().join("same.bin");
    assert!(bob.manager.is_local_file_in_writing_process(&path));

    bob.manager.start(second);
    let question = bob.questions().pop().expect("asked about the busy file");
    assert_eq!(question.transfer, second);
    assert_eq!(question.message, "The file is used by another transfer.");
    drop(listener);
}
