//! This is an end-to-end integration test using two engines which are connected by channels.
use std::{
    fs::OpenOptions,
    io::Write,
    sync::{mpsc, Arc, Once},
    thread::{self, JoinHandle},
    time::Duration,
};

use cfdp_engine::{
    config::EngineConfig,
    engine::{Engine, EngineError},
    entity::EntityProfile,
    event::{CfdpEvent, EventKind},
    request::PutRequest,
    ChecksumType, ConditionCode, DeliveryCode, EntityNumber, FileStatus,
};
use log::LevelFilter;

const LOCAL_ID: EntityNumber = EntityNumber::new(1);
const REMOTE_ID: EntityNumber = EntityNumber::new(2);

const FILE_DATA: &str = "Hello World!";

static LOGGER: Once = Once::new();

fn setup_logger() {
    LOGGER.call_once(|| {
        let _ = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{}[{}][{}] {}",
                    chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                    record.target(),
                    record.level(),
                    message
                ))
            })
            .level(LevelFilter::Debug)
            .chain(std::io::stdout())
            .apply();
    });
}

fn entity_profile(number: EntityNumber) -> EntityProfile {
    EntityProfile::new(
        number,
        "tcp".to_string(),
        "localhost".to_string(),
        5,
        ChecksumType::Crc32C as u8,
        ChecksumType::Crc32C as u8,
    )
}

fn engine(local: EntityNumber, remote: EntityNumber, working_dir: &std::path::Path) -> Arc<Engine> {
    let mut config = EngineConfig::new(local);
    config.working_dir = working_dir.to_path_buf();
    config.crc_required = true;
    let engine = Engine::new(config).expect("creating engine failed");
    engine
        .add_entity(&entity_profile(remote))
        .expect("adding remote entity failed");
    Arc::new(engine)
}

/// Move all outbound PDUs of an engine into the channel until the engine is stopped.
fn spawn_outbound(engine: Arc<Engine>, tx: mpsc::Sender<Vec<u8>>) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match engine.dequeue_outbound_pdu() {
            Ok(pdu) => {
                if tx.send(pdu.bytes).is_err() {
                    break;
                }
            }
            Err(EngineError::Stopped(_)) => break,
            Err(e) => panic!("dequeueing PDU failed: {e}"),
        }
    })
}

/// Pass all PDUs received from the channel to an engine.
fn spawn_inbound(engine: Arc<Engine>, rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(bytes) = rx.recv() {
            match engine.handle_inbound_pdu(&bytes) {
                Ok(_) => (),
                Err(EngineError::Stopped(_)) => break,
                Err(e) => panic!("handling PDU failed: {e}"),
            }
        }
    })
}

/// Consume the events of an engine until the transaction finished.
fn spawn_user(
    name: &'static str,
    engine: Arc<Engine>,
    finished_tx: mpsc::Sender<(&'static str, CfdpEvent)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Some(event) = engine.get_event() {
            println!("{name} entity: {event:?}");
            match event.kind {
                EventKind::TransactionFinished { .. } => {
                    finished_tx
                        .send((name, event))
                        .expect("sending completion failed");
                    break;
                }
                EventKind::Fault { condition, .. } | EventKind::Abandoned { condition, .. } => {
                    panic!(
                        "unexpected fault in transaction {}, condition code {:?}",
                        event.id, condition
                    );
                }
                _ => (),
            }
        }
    })
}

fn end_to_end_test(with_closure: bool) {
    setup_logger();
    let srcdir = tempfile::tempdir().expect("creating temp directory failed");
    let destdir = tempfile::tempdir().expect("creating temp directory failed");
    let srcfile = srcdir.path().join("test.txt");
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&srcfile)
        .expect("opening file failed");
    file.write_all(FILE_DATA.as_bytes())
        .expect("writing file content failed");
    let destfile = destdir.path().join("test.txt");

    let sender = engine(LOCAL_ID, REMOTE_ID, srcdir.path());
    let receiver = engine(REMOTE_ID, LOCAL_ID, destdir.path());

    let (forward_tx, forward_rx) = mpsc::channel();
    let (backward_tx, backward_rx) = mpsc::channel();
    let (finished_tx, finished_rx) = mpsc::channel();
    let handles = vec![
        spawn_outbound(sender.clone(), forward_tx),
        spawn_inbound(receiver.clone(), forward_rx),
        spawn_outbound(receiver.clone(), backward_tx),
        spawn_inbound(sender.clone(), backward_rx),
        spawn_user("sending", sender.clone(), finished_tx.clone()),
        spawn_user("receiving", receiver.clone(), finished_tx),
    ];

    let put_request = PutRequest::new_regular_request(
        REMOTE_ID,
        srcfile.to_str().expect("invalid path string"),
        Some("test.txt"),
    )
    .expect("put request creation failed")
    .with_closure_requested(with_closure);
    let id = sender.put(&put_request).expect("put request failed");

    for _ in 0..2 {
        let (name, event) = finished_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("file transfer not finished in 2 seconds");
        assert_eq!(event.id, id);
        let EventKind::TransactionFinished {
            condition,
            delivery_code,
            file_status,
            progress,
            ..
        } = event.kind
        else {
            unreachable!();
        };
        assert_eq!(condition, ConditionCode::NoError);
        assert_eq!(delivery_code, DeliveryCode::Complete);
        assert_eq!(progress, FILE_DATA.len() as u64);
        let expected_status = match name {
            "receiving" => FileStatus::Retained,
            _ if with_closure => FileStatus::Retained,
            _ => FileStatus::Unreported,
        };
        assert_eq!(file_status, expected_status);
    }
    let file = std::fs::read_to_string(destfile).expect("reading file failed");
    assert_eq!(file, FILE_DATA);
    assert_eq!(sender.outbound_transaction_count(), 0);
    assert_eq!(receiver.inbound_transaction_count(), 0);

    // Stop the threads gracefully.
    sender.stop();
    receiver.stop();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn end_to_end_test_no_closure() {
    end_to_end_test(false);
}

#[test]
fn end_to_end_test_with_closure() {
    end_to_end_test(true);
}
