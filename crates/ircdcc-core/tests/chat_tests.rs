//! DCC chat tests: offers relayed between two managers, lines exchanged
//! over loopback sockets.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{create_temp_dir, test_config, Link, Peer, CONNECTION, LOOPBACK};
use ircdcc_core::chat::ChatStatus;
use ircdcc_core::error::ErrorKind;
use ircdcc_core::protocol::DccMessage;
use ircdcc_core::transfer::TransferId;

/// The chat `bob` registered for an incoming offer.
fn incoming_chat(peer: &Peer) -> Option<TransferId> {
    peer.chats_added
        .iter()
        .find(|(_, self_opened)| !self_opened)
        .map(|(id, _)| *id)
}

/// An active chat: alice listens, bob accepts by connecting, lines flow both
/// ways and alice closing ends the chat on both sides.
#[tokio::test]
async fn test_active_chat_exchanges_lines() {
    let dir = create_temp_dir();
    let alice = Peer::new("alice", test_config(dir.path()));
    let bob = Peer::new("bob", test_config(dir.path()));
    let mut link = Link::new(alice, bob);

    let offered = link
        .a
        .manager
        .offer_chat(CONNECTION, "bob", false)
        .expect("chat queued");
    assert_eq!(link.a.chat_status(offered), Some(ChatStatus::WaitingRemote));
    let detail = link.a.manager.chat(offered).expect("chat").status_detail().to_string();
    assert!(detail.starts_with("Offering DCC Chat connection to bob on port"));

    link.run_until("offer reached bob", |l| incoming_chat(&l.b).is_some())
        .await;
    let accepted = incoming_chat(&link.b).expect("incoming chat");
    assert_eq!(link.b.chat_status(accepted), Some(ChatStatus::Queued));
    assert!(!link.b.manager.has_active_chats());

    assert!(link.b.manager.accept_chat(accepted));
    assert!(!link.b.manager.accept_chat(accepted), "already started");
    link.run_until("both chatting", |l| {
        l.a.chat_status(offered) == Some(ChatStatus::Chatting)
            && l.b.chat_status(accepted) == Some(ChatStatus::Chatting)
    })
    .await;
    assert!(link.a.manager.has_active_chats());
    assert!(link.b.manager.has_active_chats());

    assert!(link.a.manager.send_chat_line(offered, "hello bob"));
    assert!(link.b.manager.send_chat_line(accepted, "hi alice\r\n"));
    link.run_until("lines delivered", |l| {
        !l.a.lines(offered).is_empty() && !l.b.lines(accepted).is_empty()
    })
    .await;
    assert_eq!(link.b.lines(accepted), vec!["hello bob"]);
    assert_eq!(link.a.lines(offered), vec!["hi alice"]);

    link.a.manager.close_chat(offered);
    link.run_until("both closed", |l| {
        l.a.chat_finished(offered).is_some() && l.b.chat_finished(accepted).is_some()
    })
    .await;

    assert_eq!(
        link.a.chat_finished(offered).expect("closed").status,
        ChatStatus::Closed
    );
    let far = link.b.chat_finished(accepted).expect("closed");
    assert_eq!(far.status, ChatStatus::Closed);
    assert_eq!(far.status_detail, "Connection closed.");
    assert!(!link.a.manager.has_active_chats());
    assert!(!link.b.manager.send_chat_line(accepted, "too late"));
}

/// A passive chat: bob auto-accepts, listens and answers with his address
/// under alice's token; alice connects.
#[tokio::test]
async fn test_passive_chat_with_auto_accept() {
    let dir = create_temp_dir();
    let alice = Peer::new("alice", test_config(dir.path()));
    let mut bob_config = test_config(dir.path());
    bob_config.chat.auto_accept = true;
    let bob = Peer::new("bob", bob_config);
    let mut link = Link::new(alice, bob);

    let offered = link
        .a
        .manager
        .offer_chat(CONNECTION, "bob", true)
        .expect("chat queued");
    let token = link
        .a
        .manager
        .chat(offered)
        .and_then(|c| c.reverse_token().map(str::to_string))
        .expect("token");
    let sent = link.a.outbox.lock().expect("outbox").clone();
    assert!(matches!(
        &sent[0].message,
        DccMessage::Chat { port: 0, token: Some(t), .. } if *t == token
    ));

    link.run_until("both chatting", |l| {
        l.a.chat_status(offered) == Some(ChatStatus::Chatting)
            && incoming_chat(&l.b).and_then(|id| l.b.chat_status(id)) == Some(ChatStatus::Chatting)
    })
    .await;
    let accepted = incoming_chat(&link.b).expect("incoming chat");
    let listening = link.b.manager.chat(accepted).expect("chat");
    assert!(listening.is_reverse());
    assert_eq!(listening.reverse_token(), Some(token.as_str()));
    assert_eq!(
        link.a.manager.chat(offered).expect("chat").partner_port(),
        listening.own_port()
    );

    assert!(link.b.manager.send_chat_line(accepted, "over the reverse socket"));
    link.run_until("line delivered", |l| !l.a.lines(offered).is_empty())
        .await;
    assert_eq!(link.a.lines(offered), vec!["over the reverse socket"]);
    assert!(link.a.dispatch_errors.is_empty());
    assert!(link.b.dispatch_errors.is_empty());
}

/// Rejecting an offer sends `DCC REJECT CHAT` and fails the offerer's chat.
#[tokio::test]
async fn test_rejected_chat_offer() {
    let dir = create_temp_dir();
    let alice = Peer::new("alice", test_config(dir.path()));
    let bob = Peer::new("bob", test_config(dir.path()));
    let mut link = Link::new(alice, bob);

    let offered = link
        .a
        .manager
        .offer_chat(CONNECTION, "bob", false)
        .expect("chat queued");
    link.run_until("offer reached bob", |l| incoming_chat(&l.b).is_some())
        .await;
    let incoming = incoming_chat(&link.b).expect("incoming chat");

    assert!(link.b.manager.reject_chat_offer(incoming));
    link.b.drain_updates();
    let rejected = link.b.chat_finished(incoming).expect("aborted");
    assert_eq!(rejected.status, ChatStatus::Aborted);
    assert_eq!(rejected.status_detail, "You rejected the DCC Chat offer.");

    link.run_until("offer failed", |l| l.a.chat_finished(offered).is_some())
        .await;
    let failed = link.a.chat_finished(offered).expect("failed");
    assert_eq!(failed.status, ChatStatus::Failed);
    assert_eq!(failed.status_detail, "DCC Chat request was rejected");
    assert_eq!(failed.failure_kind, Some(ErrorKind::PolicyRejection));
}

/// An offer nobody answers fails after the send timeout.
#[tokio::test]
async fn test_unanswered_chat_times_out() {
    let dir = create_temp_dir();
    let mut config = test_config(dir.path());
    config.transfer.send_timeout = Duration::from_millis(150);
    let mut alice = Peer::new("alice", config);

    let offered = alice
        .manager
        .offer_chat(CONNECTION, "nobody", false)
        .expect("chat queued");
    let port = alice.manager.chat(offered).expect("chat").own_port();
    assert_ne!(port, 0);

    alice
        .run_until("chat finished", |p| p.chat_finished(offered).is_some())
        .await;
    let failed = alice.chat_finished(offered).expect("failed");
    assert_eq!(failed.status, ChatStatus::Failed);
    assert_eq!(failed.status_detail, "Timed out");
    assert_eq!(failed.failure_kind, Some(ErrorKind::TransportFailure));
}

/// A partner that sends an unterminated last line and hangs up still has
/// that line delivered.
#[tokio::test]
async fn test_partner_hangup_flushes_last_line() {
    let dir = create_temp_dir();
    let mut config = test_config(dir.path());
    config.chat.auto_accept = true;
    let mut bob = Peer::new("bob", config);

    let listener = tokio::net::TcpListener::bind((LOOPBACK, 0))
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let partner = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut heard = [0u8; 4];
        stream.read_exact(&mut heard).await.expect("read");
        stream.write_all(b"first\r\nsecond").await.expect("write");
        stream.shutdown().await.expect("shutdown");
        heard
    });

    let offer = DccMessage::Chat {
        address: LOOPBACK,
        port,
        token: None,
    };
    let id = bob
        .manager
        .handle_message(CONNECTION, "alice", &offer)
        .expect("offer")
        .expect("chat id");
    bob.run_until("chatting", |p| p.chat_status(id) == Some(ChatStatus::Chatting))
        .await;
    assert!(bob.manager.send_chat_line(id, "bye"));

    bob.run_until("chat closed", |p| p.chat_finished(id).is_some())
        .await;
    assert_eq!(bob.lines(id), vec!["first", "second"]);
    assert_eq!(
        bob.chat_finished(id).expect("closed").status,
        ChatStatus::Closed
    );
    assert_eq!(&partner.await.expect("partner"), b"bye\n");
}
