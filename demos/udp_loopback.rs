//! Copies a file between two engines in the same process which talk to each other over UDP
//! sockets on the local host.
//!
//! ```sh
//! cargo run --example udp-loopback -- -c --segment-len 256 Cargo.toml
//! ```
use std::{
    fs::OpenOptions,
    io::{self, ErrorKind, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use cfdp_engine::{
    config::EngineConfig,
    engine::{Engine, EngineError},
    entity::EntityProfile,
    event::{CfdpEvent, EventKind},
    pdu::parse_pdu,
    request::PutRequest,
    ChecksumType, EntityNumber,
};
use clap::Parser;
use log::{debug, info, warn};

const SENDER_ID: EntityNumber = EntityNumber::new(1);
const RECEIVER_ID: EntityNumber = EntityNumber::new(2);

const LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

const FILE_DATA: &str = "Hello World!";

#[derive(clap::Parser)]
#[command(about = "Copy a file between two CFDP entities connected by UDP sockets")]
pub struct Cli {
    #[arg(help = "File to copy. A small test file is created if omitted")]
    file: Option<PathBuf>,
    #[arg(short, help = "Request transaction closure")]
    closure_requested: bool,
    #[arg(long, default_value_t = 1024)]
    segment_len: usize,
    #[arg(long, default_value_t = 5111)]
    sender_port: u16,
    #[arg(long, default_value_t = 5222)]
    receiver_port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum UdpEntityError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Engine bound to a UDP socket with a single remote peer.
pub struct UdpEntity {
    name: &'static str,
    engine: Arc<Engine>,
    socket: UdpSocket,
    remote_addr: SocketAddr,
}

impl UdpEntity {
    pub fn new(
        name: &'static str,
        local: EntityNumber,
        remote: EntityNumber,
        working_dir: &Path,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<Self, UdpEntityError> {
        let mut config = EngineConfig::new(local);
        config.working_dir = working_dir.to_path_buf();
        config.crc_required = true;
        let engine = Engine::new(config)?;
        engine.add_entity(&EntityProfile::new(
            remote,
            "tcp".to_string(),
            remote_addr.to_string(),
            5,
            ChecksumType::Crc32C as u8,
            ChecksumType::Crc32C as u8,
        ))?;
        let socket = UdpSocket::bind(local_addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;
        Ok(Self {
            name,
            engine: Arc::new(engine),
            socket,
            remote_addr,
        })
    }

    /// Spawn the transport, deadline and user threads of this entity. Finished transactions
    /// are reported through `finished_tx`.
    pub fn spawn(
        &self,
        finished_tx: mpsc::Sender<(&'static str, CfdpEvent)>,
    ) -> Result<Vec<thread::JoinHandle<()>>, UdpEntityError> {
        let mut handles = Vec::new();

        let engine = self.engine.clone();
        let socket = self.socket.try_clone()?;
        let remote_addr = self.remote_addr;
        handles.push(
            thread::Builder::new()
                .name(format!("{} tx", self.name))
                .spawn(move || loop {
                    match engine.dequeue_outbound_pdu() {
                        Ok(pdu) => {
                            debug!("sending {:?} PDU of {}", pdu.kind, pdu.id);
                            if let Err(e) = socket.send_to(&pdu.bytes, remote_addr) {
                                warn!("sending PDU with UDP socket failed: {e}");
                            }
                        }
                        Err(EngineError::Stopped(_)) => break,
                        Err(e) => warn!("dequeueing PDU failed: {e}"),
                    }
                })?,
        );

        let engine = self.engine.clone();
        let socket = self.socket.try_clone()?;
        handles.push(
            thread::Builder::new()
                .name(format!("{} rx", self.name))
                .spawn(move || {
                    let mut recv_buf = vec![0; 65536];
                    while !engine.is_stopped() {
                        let len = match socket.recv_from(&mut recv_buf) {
                            Ok((len, _)) => len,
                            Err(e)
                                if e.kind() == ErrorKind::WouldBlock
                                    || e.kind() == ErrorKind::TimedOut =>
                            {
                                continue
                            }
                            Err(e) => {
                                warn!("UDP socket error: {e}");
                                break;
                            }
                        };
                        pdu_printout(&recv_buf[..len]);
                        match engine.handle_inbound_pdu(&recv_buf[..len]) {
                            Ok(disposition) => debug!("received PDU: {disposition:?}"),
                            Err(EngineError::Stopped(_)) => break,
                            Err(e) => warn!("handling PDU failed: {e}"),
                        }
                    }
                })?,
        );

        let engine = self.engine.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("{} deadlines", self.name))
                .spawn(move || {
                    while !engine.is_stopped() {
                        for (id, condition) in engine.overdue_transactions() {
                            match engine.handle_fault(id, condition) {
                                Ok(handler) => info!("{id}: {condition:?} handled with {handler:?}"),
                                Err(e) => warn!("{id}: handling {condition:?} failed: {e}"),
                            }
                        }
                        thread::sleep(Duration::from_millis(200));
                    }
                })?,
        );

        let engine = self.engine.clone();
        let name = self.name;
        handles.push(
            thread::Builder::new()
                .name(format!("{} user", self.name))
                .spawn(move || {
                    while let Some(event) = engine.get_event() {
                        info!("{}: {:?}", event.id, event.kind);
                        if matches!(event.kind, EventKind::TransactionFinished { .. }) {
                            let _ = finished_tx.send((name, event));
                        }
                    }
                })?,
        );
        Ok(handles)
    }
}

fn pdu_printout(raw: &[u8]) {
    match parse_pdu(raw) {
        Ok(pdu) => debug!(
            "{:?} PDU {}:{} with {} bytes of data field",
            pdu.header.pdu_type,
            pdu.header.source,
            pdu.header.transaction_number,
            pdu.data_field.len()
        ),
        Err(e) => warn!("received invalid PDU: {e}"),
    }
}

fn main() {
    let cli_args = Cli::parse();
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                std::thread::current().name().unwrap_or("main"),
                record.level(),
                message
            ))
        })
        .level(LOG_LEVEL)
        .chain(std::io::stdout())
        .apply()
        .unwrap();

    let srcdir = tempfile::tempdir().expect("creating temp directory failed");
    let destdir = tempfile::tempdir().expect("creating temp directory failed");
    let srcfile = match cli_args.file {
        Some(file) => std::fs::canonicalize(file).expect("invalid source file"),
        None => {
            let srcfile = srcdir.path().join("test.txt");
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&srcfile)
                .expect("opening file failed");
            file.write_all(FILE_DATA.as_bytes())
                .expect("writing file content failed");
            info!("created test source file {:?}", srcfile);
            srcfile
        }
    };
    let dest_name = srcfile
        .file_name()
        .and_then(|name| name.to_str())
        .expect("invalid file name")
        .to_string();

    let sender_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), cli_args.sender_port);
    let receiver_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), cli_args.receiver_port);
    let sender = UdpEntity::new(
        "sender",
        SENDER_ID,
        RECEIVER_ID,
        srcdir.path(),
        sender_addr,
        receiver_addr,
    )
    .expect("creating sending entity failed");
    let receiver = UdpEntity::new(
        "receiver",
        RECEIVER_ID,
        SENDER_ID,
        destdir.path(),
        receiver_addr,
        sender_addr,
    )
    .expect("creating receiving entity failed");

    let (finished_tx, finished_rx) = mpsc::channel();
    let mut handles = sender
        .spawn(finished_tx.clone())
        .expect("spawning sender threads failed");
    handles.extend(
        receiver
            .spawn(finished_tx)
            .expect("spawning receiver threads failed"),
    );

    let put_request = PutRequest::new_regular_request(
        RECEIVER_ID,
        srcfile.to_str().expect("invalid path string"),
        Some(&dest_name),
    )
    .expect("put request creation failed")
    .with_closure_requested(cli_args.closure_requested)
    .with_segment_len(cli_args.segment_len);
    let id = sender.engine.put(&put_request).expect("put request failed");
    info!("started transaction {id}");

    for _ in 0..2 {
        match finished_rx.recv_timeout(Duration::from_secs(30)) {
            Ok((name, event)) => info!("{name} finished: {:?}", event.kind),
            Err(_) => {
                warn!("file transfer not finished in 30 seconds");
                break;
            }
        }
    }
    let destfile = destdir.path().join(&dest_name);
    match std::fs::metadata(&destfile) {
        Ok(metadata) => info!("received {:?} with {} bytes", destfile, metadata.len()),
        Err(e) => warn!("destination file {:?} missing: {e}", destfile),
    }

    sender.engine.stop();
    receiver.engine.stop();
    for handle in handles {
        handle.join().unwrap();
    }
}
