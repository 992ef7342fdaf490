use std::sync::{Arc, Mutex};

use farm_books::sync::server::{self, RemoteLedger};

fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt::init();
  let addr = std::env::args()
    .nth(1)
    .or_else(|| std::env::var("FARM_BOOKS_SYNC_ADDR").ok())
    .unwrap_or_else(|| "127.0.0.1:48080".to_string());

  let server = Arc::new(server::bind(&addr)?);
  server::serve(server, Arc::new(Mutex::new(RemoteLedger::default())));
  Ok(())
}
