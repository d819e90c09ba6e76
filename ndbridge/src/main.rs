mod config;
mod log;

use crate::{config::parse_opts, log::*};
use ndbridge_lib::*;

fn main() {
  let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
  runtime_builder.enable_all();
  runtime_builder.thread_name("ndbridge");
  let runtime = runtime_builder.build().unwrap();

  init_logger();

  runtime.block_on(async {
    let opts = match parse_opts() {
      Ok(opts) => opts,
      Err(e) => {
        error!("Invalid options: {e}");
        std::process::exit(1);
      }
    };

    info!("Starting ndbridge: {} -> {}", opts.listen_on, opts.upstream);

    let bridge_server = BridgeServerBuilder::default()
      .listen_on(opts.listen_on)
      .upstream(opts.upstream)
      .replay_prelude(opts.replay_prelude)
      .runtime_handle(runtime.handle().clone())
      .build()
      .unwrap();

    let cancel_token = tokio_util::sync::CancellationToken::new();

    tokio::select! {
      res = bridge_server.start(cancel_token.child_token()) => {
        if let Err(e) = res {
          error!("Bridge server stopped: {}", e);
        }
      }
      _ = tokio::signal::ctrl_c() => {
        info!("Shutdown signal received");
        cancel_token.cancel();
      }
    }
  });
}
