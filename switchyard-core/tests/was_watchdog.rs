//! End-to-end tests for the WAS idle watchdog over real sockets and
//! pipes.

use std::os::fd::OwnedFd;
use std::time::Duration;

use switchyard_core::was::control::{WasCommand, encode_packet};
use switchyard_core::was::launch::create_was_channels;
use switchyard_core::was::{WasIdleConnection, WasProtocolError};

struct FakeServer {
    control: OwnedFd,
    stdout: OwnedFd,
    _stdin: OwnedFd,
}

fn setup() -> (WasIdleConnection, FakeServer) {
    let (parent, (control, stdin, stdout)) = create_was_channels().expect("channels");
    let connection = WasIdleConnection::new(parent).expect("connection");

    (
        connection,
        FakeServer {
            control,
            stdout,
            _stdin: stdin,
        },
    )
}

fn write_all(fd: &OwnedFd, mut data: &[u8]) {
    while !data.is_empty() {
        let n = nix::unistd::write(fd, data).expect("write");
        data = &data[n..];
    }
}

async fn assert_still_clean(connection: &WasIdleConnection) {
    tokio::select! {
        e = connection.wait_broken() => panic!("connection died: {e}"),
        () = tokio::time::sleep(Duration::from_millis(100)) => {}
    }
}

#[tokio::test]
async fn unexpected_data_is_fatal() {
    let (connection, server) = setup();

    write_all(&server.control, &[0x42]);

    assert_eq!(
        connection.wait_broken().await,
        WasProtocolError::UnexpectedData
    );
}

#[tokio::test]
async fn peer_hangup_is_fatal() {
    let (connection, server) = setup();

    drop(server.control);

    assert_eq!(connection.wait_broken().await, WasProtocolError::Closed);
}

#[tokio::test]
async fn premature_recovery_returns_to_clean_idle() {
    let (connection, server) = setup();

    /* the client had consumed 512 bytes when it sent STOP */
    connection.stop(512);
    assert!(!connection.may_borrow());

    /* the server confirms with PREMATURE 1024; 512 residual bytes
       must be drained from the data pipe */
    write_all(
        &server.control,
        &encode_packet(WasCommand::Premature, &1024u64.to_le_bytes()),
    );
    write_all(&server.stdout, &[0u8; 256]);

    /* the tail arrives a bit later */
    tokio::time::sleep(Duration::from_millis(10)).await;
    write_all(&server.stdout, &[0u8; 256]);

    assert_still_clean(&connection).await;
    assert!(connection.may_borrow());
}

#[tokio::test]
async fn nop_and_benign_packets_are_skipped() {
    let (connection, server) = setup();

    connection.stop(0);

    let mut wire = encode_packet(WasCommand::Nop, &[]);
    wire.extend_from_slice(&encode_packet(WasCommand::Metric, b"rss=1234"));
    wire.extend_from_slice(&encode_packet(WasCommand::Premature, &0u64.to_le_bytes()));
    write_all(&server.control, &wire);

    assert_still_clean(&connection).await;
    assert!(connection.may_borrow());
}

#[tokio::test]
async fn bogus_premature_count_is_fatal() {
    let (connection, server) = setup();

    /* 400 < 512: the server claims fewer bytes than the client
       already consumed */
    connection.stop(512);
    write_all(
        &server.control,
        &encode_packet(WasCommand::Premature, &400u64.to_le_bytes()),
    );

    assert_eq!(
        connection.wait_broken().await,
        WasProtocolError::BogusPremature
    );
}

#[tokio::test]
async fn foreign_packet_during_recovery_is_fatal() {
    let (connection, server) = setup();

    connection.stop(0);
    write_all(
        &server.control,
        &encode_packet(WasCommand::Request, &[]),
    );

    assert_eq!(
        connection.wait_broken().await,
        WasProtocolError::UnexpectedData
    );
}

#[tokio::test]
async fn data_after_recovery_is_fatal() {
    let (connection, server) = setup();

    connection.stop(0);
    write_all(
        &server.control,
        &encode_packet(WasCommand::Premature, &0u64.to_le_bytes()),
    );

    assert_still_clean(&connection).await;

    /* once recovered, the connection is clean idle again - any byte
       is unsolicited */
    write_all(&server.control, &[0x01]);
    assert_eq!(
        connection.wait_broken().await,
        WasProtocolError::UnexpectedData
    );
}
