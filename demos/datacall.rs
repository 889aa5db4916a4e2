// Copyright 2020 Joyent, Inc.

use std::net::{SocketAddr, TcpStream};
use std::process;

use clap::{crate_version, value_t, App, Arg, ArgMatches};

use dataserve::blocks::{ClientBlock, RequestData};
use dataserve::client;
use dataserve::config::LEGACY_SERVER_VERSION;
use dataserve::types::{decode_f64, DataBlock, DataType};

static APP: &'static str = "datacall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u32 = 56565;
const DEFAULT_VERSION: i32 = 9;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for fetching data from a data server")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote server (Default: 56565)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("signal")
                .help("Signal name or function call, e.g. SERVER::help()")
                .long("signal")
                .short("s")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("source")
                .help("Data source, e.g. 12345/1 or BYTES::/path/to/file")
                .long("source")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("protocol")
                .help("Client protocol version (Default: 9)")
                .long("protocol")
                .short("v")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("meta")
                .help("Request the metadata blocks")
                .long("meta")
                .short("m")
                .takes_value(false),
        )
        .get_matches()
}

fn print_block(block: &DataBlock) {
    println!(
        "rank {} type {:?} count {} label {:?} units {:?}",
        block.rank, block.data_type, block.data_n, block.data_label, block.data_units
    );
    match block.data_type {
        DataType::String | DataType::Char => {
            println!("{}", String::from_utf8_lossy(&block.data))
        }
        t => match decode_f64(t, &block.data) {
            Some(values) => println!("{:?}", values),
            None => println!("{} bytes of {:?} data", block.data.len(), t),
        },
    }
}

fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let version =
        value_t!(matches, "protocol", i32).unwrap_or(DEFAULT_VERSION);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let signal = matches.value_of("signal").unwrap_or_else(|| {
        eprintln!("Failed to parse signal argument as String");
        process::exit(1)
    });
    let source = matches.value_of("source").unwrap_or("");

    let mut stream = TcpStream::connect(&addr).unwrap_or_else(|e| {
        eprintln!("Failed to connect to server: {}", e);
        process::exit(1)
    });

    let client = ClientBlock {
        get_meta: matches.is_present("meta"),
        ..ClientBlock::new(version, 60)
    };
    let request = RequestData::new(signal, source);

    let result = client::handshake(&mut stream, &client).and_then(|ack| {
        if ack.failed() {
            return Ok(client::Reply {
                server: ack,
                metadata: None,
                data: None,
            });
        }
        if version <= LEGACY_SERVER_VERSION {
            client::legacy_get(&mut stream, &client, &request, true)
        } else {
            client::get(&mut stream, &client, &request)
        }
    });

    match result {
        Ok(reply) => {
            for record in reply.server.errors.iter() {
                eprintln!("Error: {}", record);
            }
            if let Some(metadata) = reply.metadata {
                println!("{:#?}", metadata);
            }
            if let Some(block) = reply.data {
                print_block(&block);
            }
        }
        Err(e) => eprintln!("Error: {}", e),
    }

    let _ = client::closedown(&mut stream);
}
