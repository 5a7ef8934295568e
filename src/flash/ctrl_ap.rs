//! Protection-breaking mass erase via the vendor Control Access Port.
//!
//! Unlike [`crate::flash::nvmc::Nvmc::mass_erase`], this path clears
//! read-out protection (APPROTECT) along with application flash, at the
//! cost of a full link reset: the CTRL-AP sequence ends by disconnecting
//! and reconnecting the DP, so any [`MemAp`] in use must be
//! [`MemAp::invalidate`]d afterward (this module does so itself).

use crate::ap::{IDR, IDR_BANK};
use crate::dp::DebugInterface;
use crate::error::{ApError, FlashError};
use crate::mem_ap::MemAp;

/// The vendor Control Access Port is always AP#1 on this target family.
const CTRL_AP_NUMBER: u8 = 1;

const RESET: u8 = 0x00;
const ERASEALL: u8 = 0x04;
const ERASEALLSTATUS: u8 = 0x08;
const APPROTECTSTATUS: u8 = 0x0C;

// The top nibble (revision) and bottom 16 bits (version/patch) of the IDR
// vary by silicon revision; only the designer+part field in bits [27:16]
// identifies the vendor's CTRL-AP.
const IDR_MASK: u32 = 0x0FFF_0000;
const IDR_EXPECTED: u32 = 0x0288_0000;

const ERASEALLSTATUS_TIMEOUT_MS: u32 = 15_000;
const ERASEALLSTATUS_POLL_INTERVAL_MS: u32 = 100;
const RESET_PULSE_MS: u32 = 10;

fn ap(e: crate::error::DpError) -> ApError {
    ApError::Dp(e)
}

/// Reads the CTRL-AP identity register and checks it against the known
/// vendor value, masking off the version nibble.
fn check_identity(dp: &mut DebugInterface) -> Result<u32, FlashError> {
    let idr = dp.ap_read(CTRL_AP_NUMBER, IDR_BANK, IDR).map_err(ap)?;
    if idr & IDR_MASK != IDR_EXPECTED {
        return Err(FlashError::Protected(idr));
    }
    Ok(idr)
}

/// Runs the full protection-breaking mass erase: identity check, ERASEALL,
/// ERASEALLSTATUS poll, a RESET pulse, then a DP disconnect/reconnect to
/// leave the link in a known-good state for whatever comes next.
///
/// `mem` is invalidated (its cached TAR dropped) once this returns, since
/// the reconnect makes any previously-cached AP state stale.
pub fn mass_erase(mem: &mut MemAp, dp: &mut DebugInterface) -> Result<(), FlashError> {
    let idr = check_identity(dp)?;
    tracing::info!("CTRL-AP identity 0x{idr:08x} accepted");

    let protect_status = dp.ap_read(CTRL_AP_NUMBER, 0, APPROTECTSTATUS).map_err(ap)?;
    tracing::debug!("APPROTECTSTATUS = 0x{protect_status:08x}");

    dp.ap_write(CTRL_AP_NUMBER, 0, ERASEALL, 1).map_err(ap)?;
    dp.drain().map_err(ap)?;

    let mut elapsed_ms = 0u32;
    loop {
        let status = dp.ap_read(CTRL_AP_NUMBER, 0, ERASEALLSTATUS).map_err(ap)?;
        if status == 0 {
            break;
        }
        if elapsed_ms >= ERASEALLSTATUS_TIMEOUT_MS {
            return Err(FlashError::Timeout("CTRL-AP ERASEALLSTATUS"));
        }
        dp.delay_ms(ERASEALLSTATUS_POLL_INTERVAL_MS);
        elapsed_ms += ERASEALLSTATUS_POLL_INTERVAL_MS;
    }

    dp.ap_write(CTRL_AP_NUMBER, 0, RESET, 1).map_err(ap)?;
    dp.drain().map_err(ap)?;
    dp.delay_ms(RESET_PULSE_MS);
    dp.ap_write(CTRL_AP_NUMBER, 0, RESET, 0).map_err(ap)?;
    dp.drain().map_err(ap)?;
    dp.delay_ms(RESET_PULSE_MS);

    dp.ap_write(CTRL_AP_NUMBER, 0, ERASEALL, 0).map_err(ap)?;
    dp.drain().map_err(ap)?;

    dp.disconnect();
    dp.connect().map_err(ap)?;
    mem.invalidate();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0x1288_0000, true; "exact vendor id")]
    #[test_case(0x0288_0001, true; "differing version still accepted")]
    #[test_case(0x0477_0000, false; "different vendor rejected")]
    fn identity_mask_matches_scenario(idr: u32, expect_accept: bool) {
        assert_eq!((idr & IDR_MASK) == IDR_EXPECTED, expect_accept);
    }
}
