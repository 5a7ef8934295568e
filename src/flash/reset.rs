//! Post-flash reset-and-release: returns the target to a clean running
//! state and tears down the debug link, regardless of how the preceding
//! flash operations went.

use crate::dp::DebugInterface;
use crate::error::ApError;
use crate::mem_ap::MemAp;

const NVMC_CONFIG: u32 = 0x4001_E504;
const NVMC_ICACHECNF: u32 = 0x4001_E540;
const VTOR: u32 = 0xE000_ED08;
const DHCSR: u32 = 0xE000_EDF0;
const DEMCR: u32 = 0xE000_EDFC;
const AIRCR: u32 = 0xE000_ED0C;

const DHCSR_DBGKEY: u32 = 0xA05F << 16;
const DHCSR_C_DEBUGEN: u32 = 1 << 0;
const DHCSR_S_HALT: u32 = 1 << 17;

/// VECTKEY (0x05FA) in the upper half, SYSRESETREQ set in the lower half.
const AIRCR_SYSRESETREQ: u32 = 0x05FA_0004;

const RESET_ASSERT_MS: u32 = 10;
const RESET_SETTLE_MS: u32 = 50;

/// Puts NVMC back in read-only, invalidates the instruction cache, clears
/// VTOR, disables debug, and resets the core (hardware pin if wired,
/// otherwise AIRCR.SYSRESETREQ), then disconnects the DP. The disconnect
/// always runs, even if an earlier step failed, so calling this twice in a
/// row never leaves the link stuck.
pub fn reset_and_release(mem: &mut MemAp, dp: &mut DebugInterface) -> Result<(), ApError> {
    let result = run(mem, dp);
    dp.disconnect();
    result
}

fn run(mem: &mut MemAp, dp: &mut DebugInterface) -> Result<(), ApError> {
    mem.write32(dp, NVMC_CONFIG, 0)?;

    mem.write32(dp, NVMC_ICACHECNF, 0x1)?;
    mem.write32(dp, NVMC_ICACHECNF, 0x3)?;

    mem.write32(dp, VTOR, 0)?;

    let status = mem.read32(dp, DHCSR)?;
    if status & DHCSR_S_HALT != 0 {
        mem.write32(dp, DHCSR, DHCSR_DBGKEY | DHCSR_C_DEBUGEN)?;
    }
    mem.write32(dp, DHCSR, DHCSR_DBGKEY)?;
    mem.write32(dp, DEMCR, 0)?;

    if dp.has_reset_pin() {
        dp.set_reset(true);
        dp.delay_ms(RESET_ASSERT_MS);
        dp.set_reset(false);
        dp.delay_ms(RESET_SETTLE_MS);
    } else {
        // The target resets immediately on this write; a failed ACK here
        // is expected, not an error worth surfacing over a clean reset.
        let _ = mem.write32(dp, AIRCR, AIRCR_SYSRESETREQ);
    }

    Ok(())
}
