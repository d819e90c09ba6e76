use anyhow::anyhow;
use clap::Arg;
use ndbridge_lib::Endpoint;
use std::net::SocketAddr;

/// Parsed options
pub struct Opts {
  /// Listen socket address
  pub listen_on: SocketAddr,
  /// Upstream inspector endpoint
  pub upstream: Endpoint,
  /// Replay the session prelude into a reconnected upstream
  pub replay_prelude: bool,
}

/// Parse arg values passed from cli
pub fn parse_opts() -> Result<Opts, anyhow::Error> {
  let _ = include_str!("../../Cargo.toml");
  let options = clap::command!()
    .arg(
      Arg::new("listen")
        .long("listen")
        .short('l')
        .value_name("ADDR")
        .default_value("127.0.0.1:9228")
        .help("Stable listen socket address like 127.0.0.1:9228"),
    )
    .arg(
      Arg::new("upstream")
        .long("upstream")
        .short('u')
        .value_name("ADDR")
        .default_value("localhost:9229")
        .help("Upstream inspector address like localhost:9229"),
    )
    .arg(
      Arg::new("no_replay")
        .long("no-replay")
        .action(clap::ArgAction::SetTrue)
        .help("Do not replay the captured session prelude after a reconnect"),
    );
  let matches = options.get_matches();

  ///////////////////////////////////
  let listen_on = matches
    .get_one::<String>("listen")
    .ok_or_else(|| anyhow!("listen address is required"))?
    .parse::<SocketAddr>()
    .map_err(|e| anyhow!("Invalid listen address: {e}"))?;
  let upstream = matches
    .get_one::<String>("upstream")
    .ok_or_else(|| anyhow!("upstream address is required"))?
    .parse::<Endpoint>()?;
  let replay_prelude = !matches.get_flag("no_replay");

  Ok(Opts {
    listen_on,
    upstream,
    replay_prelude,
  })
}
