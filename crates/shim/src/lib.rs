//! The cmdmox launcher ("shim").
//!
//! One binary is linked under many command names inside the controller's
//! shim directory. When the code under test runs `git`, PATH resolution
//! lands here instead; the launcher captures the call, ships it to the
//! controller over IPC, and applies whatever behavior comes back. It knows
//! nothing about matching, ordering, or verification — it is a pure
//! executor of the controller's instructions.
//!
//! Flow per invocation:
//!
//! ```text
//! argv[0] → command identity
//! stdin (when piped) + env snapshot → Invocation
//! connect CMDMOX_IPC_SOCKET → send → await response
//!   static response:      merge env, write stdio, exit
//!   passthrough request:  run the real binary, report the result,
//!                         await the final response, then as above
//! ```

use std::io::Write;

use anyhow::{bail, Context, Result};
use cmdmox_common::wire::WireMessage;
use cmdmox_common::CommandResponse;
use cmdmox_ipc::IpcClient;

pub use context::ShimContext;

mod context;
mod passthrough;

/// Execute one shimmed invocation and return the exit code to report.
///
/// Transport and protocol failures surface as `Err`; the binary turns them
/// into a stderr diagnostic and a nonzero exit without ever reaching the
/// controller's journal.
pub fn run_shim() -> Result<i32> {
    let ctx = ShimContext::from_environment()?;
    let endpoint = ctx.endpoint()?;
    let client_config = ctx.client_config()?;

    let mut client = IpcClient::connect(&endpoint, &client_config)
        .with_context(|| format!("connecting to controller at {}", endpoint.address()))?;

    let invocation = ctx.invocation();
    let mut response = client
        .roundtrip(&WireMessage::Invocation(invocation))
        .context("sending invocation")?;

    if let Some(request) = response.passthrough.take() {
        let result = passthrough::run_real_command(&ctx, &request);
        response = client
            .roundtrip(&WireMessage::PassthroughResult(result))
            .context("reporting passthrough result")?;
        if response.passthrough.is_some() {
            bail!("controller requested passthrough twice for one invocation");
        }
    }

    apply_response(&response)
}

/// Apply a static response: merge env overrides into this process (so
/// later commands in the same shell inherit them), then write the scripted
/// stdio verbatim.
fn apply_response(response: &CommandResponse) -> Result<i32> {
    for (key, value) in &response.env {
        std::env::set_var(key, value);
    }

    let mut stdout = std::io::stdout();
    stdout
        .write_all(response.stdout.as_bytes())
        .and_then(|()| stdout.flush())
        .context("writing stdout")?;

    let mut stderr = std::io::stderr();
    stderr
        .write_all(response.stderr.as_bytes())
        .and_then(|()| stderr.flush())
        .context("writing stderr")?;

    Ok(response.exit_code)
}
