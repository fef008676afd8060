//! Kernel command line overrides.
//!
//! Boot-time settings that must be known before any config file is trusted
//! live on the kernel command line in the `crinit.` namespace, currently the
//! signature enablement and the signed-key directory. Tokens outside the
//! namespace belong to the kernel or other programs and are skipped.

use log::warn;

use crate::error::Result;
use crate::global_opts::GlobalOpts;
use crate::lexers::{self, KernelCmdlineToken};

use super::{ConfigContext, find_kcmdline_directive};

const NAMESPACE_PREFIX: &str = "crinit.";

/// Parse kernel command line text, applying `crinit.*` settings to `opts`.
pub fn parse_kernel_cmdline(opts: &mut GlobalOpts, cmdline: &str) -> Result<()> {
    let mut cursor = cmdline;
    loop {
        match lexers::next_kernel_cmdline_token(&mut cursor)? {
            KernelCmdlineToken::Setting { key, value } => {
                let Some(sub_key) = key.strip_prefix(NAMESPACE_PREFIX) else {
                    continue;
                };
                match find_kcmdline_directive(sub_key) {
                    Some(def) => {
                        (def.handler)(opts, value, ConfigContext::KernelCmdline)?;
                    }
                    None => {
                        warn!("Ignoring unknown kernel command line setting: {key}");
                    }
                }
            }
            KernelCmdlineToken::Whitespace | KernelCmdlineToken::Other(_) => {}
            KernelCmdlineToken::End => return Ok(()),
        }
    }
}

/// Parse `/proc/cmdline` of the running kernel.
pub fn parse_proc_cmdline(opts: &mut GlobalOpts) -> Result<()> {
    let cmdline = std::fs::read_to_string("/proc/cmdline")
        .map_err(|e| crate::error::Error::io("reading /proc/cmdline", e))?;
    parse_kernel_cmdline(opts, cmdline.trim_end_matches('\n'))
}
