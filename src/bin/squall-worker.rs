//! Minimal worker-side program: dials the coordinator, greets it, and
//! logs every framed message it is sent. Useful for poking at a running
//! coordinator without a real worker deployment.

extern crate clap;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate squall;

use std::cell::RefCell;
use std::net::{SocketAddr, ToSocketAddrs};
use std::process::exit;
use std::rc::Rc;

use clap::{App, Arg};

use squall::errors::{Result, ResultExt};
use squall::exec::ExecutionLoop;
use squall::net::connection::ConnectionKind;
use squall::proto::messages::hey_frame;
use squall::proto::MessageParser;

fn run() -> Result<()> {
    let matches = App::new("squall-worker")
        .version(squall::VERSION)
        .about("Connects back to a squall coordinator and echoes what it is told")
        .arg(
            Arg::with_name("DESTINATION")
                .help("Coordinator host")
                .required(true),
        )
        .arg(
            Arg::with_name("PORT")
                .help("Coordinator port")
                .required(true),
        )
        .get_matches();

    let destination = matches.value_of("DESTINATION").unwrap();
    let port: u16 = matches
        .value_of("PORT")
        .unwrap()
        .parse()
        .chain_err(|| "invalid port")?;

    let coordinator: SocketAddr = match (destination, port).to_socket_addrs()?.next() {
        Some(addr) => addr,
        None => return Err(format!("cannot resolve {}", destination).into()),
    };

    let exec_loop = ExecutionLoop::new()?;
    let parser = Rc::new(RefCell::new(MessageParser::new()));

    let connection = exec_loop.make_connection(
        &coordinator,
        ConnectionKind::Plain,
        Box::new(move |data| {
            let mut parser = parser.borrow_mut();
            parser.parse(data)?;
            while let Some(message) = parser.pop() {
                info!(
                    "message {:?} ({} bytes): {}",
                    message.opcode,
                    message.payload.len(),
                    String::from_utf8_lossy(&message.payload)
                );
            }
            Ok(true)
        }),
        Box::new(|| {
            error!("connection error");
            exit(1);
        }),
        Box::new(|| {
            info!("connection closed");
            exit(0);
        }),
    )?;
    connection.enqueue_write(&hey_frame(&format!(
        "squall-worker {} (protocol {}) reporting in",
        squall::VERSION,
        squall::WORKER_PROTOCOL_VERSION
    )));

    info!("connected to {}", coordinator);
    exec_loop.run()
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        error!("{}", e);
        exit(1);
    }
}
