//! Sends one responder request to a FastCGI application and prints its output.
//!
//!     cargo run --example request -- 127.0.0.1:9000 /var/www/index.php [body]

extern crate env_logger;
extern crate fastcgi_client;

use fastcgi_client::*;

use std::env;
use std::io;
use std::net::TcpStream;
use std::process;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 2 {
        eprintln!("usage: request <host:port> <script filename> [body]");
        process::exit(2);
    }

    let stream = TcpStream::connect(&args[0]).expect("failed to connect");
    let client = Client::from_tcp(stream).expect("failed to set up the client");

    match client.get_values(&[FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS]) {
        Ok(values) => println!("{:#?}", values),
        Err(e) => eprintln!("GetValues failed: {}", e),
    }

    let mut request = client.new_request().expect("failed to allocate a request id");
    let body = args.get(2).cloned().unwrap_or_default();
    request
        .set_param("GATEWAY_INTERFACE", "FastCGI/1.0")
        .set_param("REQUEST_METHOD", if body.is_empty() { "GET" } else { "POST" })
        .set_param("SCRIPT_FILENAME", args[1].as_str())
        .set_param("SCRIPT_NAME", args[1].as_str())
        .set_param("QUERY_STRING", "")
        .set_param("CONTENT_LENGTH", body.len().to_string())
        .set_content(body);

    let stdout = io::stdout();
    let stderr = io::stderr();
    match client.handle(&mut stdout.lock(), &mut stderr.lock(), request) {
        Ok(end) => eprintln!("\napp status {}, protocol status {:?}", end.app_status, end.status()),
        Err(e) => {
            eprintln!("request failed: {}", e);
            process::exit(1);
        }
    }
}
