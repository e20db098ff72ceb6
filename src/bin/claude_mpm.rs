//! claude-mpm driver binary.
//!
//! Runs an orchestrated claude session with agent delegation and ticket
//! tracking. By default an interactive session starts; use
//! `-i "prompt"` (or pipe stdin with `--non-interactive`) for a one-shot
//! run, and `--subprocess` to fan detected delegations out as real
//! subprocesses.
//!
//! # Environment Variables
//!
//! - `CLAUDE_MPM_HOOKS_URL` — hook service base URL (default: `http://localhost:5001`)
//! - `CLAUDE_MPM_SOCKETIO_PORT` — Socket.IO event stream port
//! - `RUST_LOG` — log filter (combined with `--logging`)

#[tokio::main]
async fn main() {
    let code = claude_mpm::cli::main().await;
    std::process::exit(code);
}
