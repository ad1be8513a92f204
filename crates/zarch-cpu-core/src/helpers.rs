//! The helper surface as data.
//!
//! Translated code names the helper it needs with a [`HelperCall`] (operands already decoded and
//! effective addresses already computed) and hands it to [`Vcpu::call`]. Calls are grouped by
//! operand shape; the inner `*Op` enum picks the instruction.

use crate::cc::{calc_cc, CcOp};
use crate::exception::Exception;
use crate::exec::{ex, Dispatch, Vcpu};
use crate::fpu::Precision;
use crate::interp::{alu, atomics, decimal, string, Completion};
use crate::paging_bus::PagingBus;
use crate::{fpu, system};

/// Storage-to-storage with one length (L is the length code, one less than the byte count).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsOp {
    Nc,
    Oc,
    Xc,
    Mvc,
    Clc,
    Tr,
    Trt,
}

/// Storage-to-storage with two lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalOp {
    Pack,
    Unpk,
}

/// Register, mask and storage operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskOp {
    Clm,
    Clmh,
    Stcm,
    Stcmh,
    Icm,
    Icmh,
}

/// Register range R1..R3 (or register pairs) and a storage operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Stam,
    Lam,
    Lctl,
    Lctlg,
    Stctl,
    Stctg,
    Cs,
    Csg,
    Cds,
    Cdsg,
    Mvcle,
    Clcle,
}

/// Two register designations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegPairOp {
    Mvcl,
    Clcl,
    Srst,
    Clst,
    Mvst,
    Cksm,
    Mvpg,
    Csp,
    Iske,
    Sske,
    Ipte,
    Stura,
    Servc,
}

/// Register and storage operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAddrOp {
    Cvd,
    Cvb,
    Lra,
}

/// Storage operand only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrOp {
    Sck,
    Stck,
    Stcke,
    Sckc,
    Stckc,
    Spt,
    Stpt,
    Spx,
    Stpx,
    Stidp,
    Stsi,
    Sacf,
    Lpswe,
}

/// Register and a second-operand value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOp {
    Mlg,
    Dlg,
    Flogr,
    Lpr,
    Lpgr,
    Lnr,
    Lngr,
    Lcr,
    Lcgr,
    Alc,
    Alcg,
    Slb,
    Slbg,
}

/// BFP register-register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpRegOp {
    Aebr,
    Adbr,
    Axbr,
    Sebr,
    Sdbr,
    Sxbr,
    Meebr,
    Mdbr,
    Mxbr,
    Debr,
    Ddbr,
    Dxbr,
    Cebr,
    Cdbr,
    Cxbr,
    Kebr,
    Kdbr,
    Kxbr,
    Sqebr,
    Sqdbr,
    Sqxbr,
    Ltebr,
    Ltdbr,
    Ltxbr,
    Lcebr,
    Lcdbr,
    Lcxbr,
    Lpebr,
    Lpdbr,
    Lpxbr,
    Lnebr,
    Lndbr,
    Lnxbr,
    Ldebr,
    Lxdbr,
    Lxebr,
}

/// BFP register and storage operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpMemOp {
    Aeb,
    Adb,
    Seb,
    Sdb,
    Meeb,
    Mdb,
    Deb,
    Ddb,
    Cdb,
    Ldeb,
    Lxdb,
}

/// BFP operations with an M3 rounding modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpRoundOp {
    Ledbr,
    Ldxbr,
    Lexbr,
    Cefbr,
    Cdfbr,
    Cxfbr,
    Cegbr,
    Cdgbr,
    Cxgbr,
    Cfebr,
    Cfdbr,
    Cfxbr,
    Cgebr,
    Cgdbr,
    Cgxbr,
    Fiebr,
    Fidbr,
    Fixbr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusedOp {
    Maebr,
    Madbr,
    Msebr,
    Msdbr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusedMemOp {
    Madb,
    Msdb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperCall {
    Ss { op: SsOp, l: u8, a1: u64, a2: u64 },
    Decimal { op: DecimalOp, l1: u8, l2: u8, a1: u64, a2: u64 },
    Mask { op: MaskOp, r1: usize, mask: u8, addr: u64 },
    Range { op: RangeOp, r1: usize, r3: usize, addr: u64 },
    RegPair { op: RegPairOp, r1: usize, r2: usize },
    RegAddr { op: RegAddrOp, r1: usize, addr: u64 },
    Addr { op: AddrOp, addr: u64 },
    Value { op: ValueOp, r1: usize, value: u64 },
    /// MVCS (`secondary == true`) or MVCP; the true length is in R1, the key in R3.
    MoveSpace { secondary: bool, r1: usize, r3: usize, a1: u64, a2: u64 },
    Ipm { r1: usize },
    Rrbe { r2: usize },
    Tprot { a1: u64, a2: u64 },
    Ptlb,
    Sigp { r1: usize, r3: usize, addr: u64 },
    Diag { r1: usize, r3: usize, code: u16 },
    LoadPsw { mask: u64, addr: u64 },
    FpReg { op: FpRegOp, r1: usize, r2: usize },
    FpMem { op: FpMemOp, r1: usize, addr: u64 },
    FpRound { op: FpRoundOp, r1: usize, r2: usize, m3: u8 },
    Fused { op: FusedOp, r1: usize, r3: usize, r2: usize },
    FusedMem { op: FusedMemOp, r1: usize, r3: usize, addr: u64 },
    /// LZER, LZDR, LZXR.
    LoadZero { precision: Precision, r1: usize },
    /// TCEB, TCDB, TCXB; `mask` is the second-operand address.
    TestDataClass { precision: Precision, r1: usize, mask: u64 },
    /// Deferred condition-code evaluation.
    CalcCc { op: CcOp, src: u64, dst: u64, vr: u64 },
}

fn done(result: Result<(), Exception>) -> Result<Completion, Exception> {
    result.map(|()| Completion::Done)
}

impl Vcpu {
    /// Runs one helper against this CPU.
    ///
    /// `Ok(Completion::Interrupted)` means an interruptible instruction stopped early with its
    /// registers describing the remaining work; service requests and re-execute it.
    pub fn call(&mut self, call: HelperCall) -> Result<Completion, Exception> {
        let limit = self.machine().config().cpu_determined_bytes;
        let machine = std::sync::Arc::clone(self.machine());
        let cpu = &mut self.state;
        let bus: &mut PagingBus = &mut self.bus;

        match call {
            HelperCall::Ss { op, l, a1, a2 } => done(match op {
                SsOp::Nc => string::nc(cpu, bus, l, a1, a2),
                SsOp::Oc => string::oc(cpu, bus, l, a1, a2),
                SsOp::Xc => string::xc(cpu, bus, l, a1, a2),
                SsOp::Mvc => string::mvc(cpu, bus, l, a1, a2),
                SsOp::Clc => string::clc(cpu, bus, l, a1, a2),
                SsOp::Tr => string::tr(cpu, bus, l, a1, a2),
                SsOp::Trt => string::trt(cpu, bus, l, a1, a2),
            }),
            HelperCall::Decimal { op, l1, l2, a1, a2 } => done(match op {
                DecimalOp::Pack => decimal::pack(cpu, bus, l1, l2, a1, a2),
                DecimalOp::Unpk => decimal::unpk(cpu, bus, l1, l2, a1, a2),
            }),
            HelperCall::Mask { op, r1, mask, addr } => done(match op {
                MaskOp::Clm => string::clm(cpu, bus, r1, mask, addr),
                MaskOp::Clmh => string::clmh(cpu, bus, r1, mask, addr),
                MaskOp::Stcm => string::stcm(cpu, bus, r1, mask, addr),
                MaskOp::Stcmh => string::stcmh(cpu, bus, r1, mask, addr),
                MaskOp::Icm => string::icm(cpu, bus, r1, mask, addr),
                MaskOp::Icmh => string::icmh(cpu, bus, r1, mask, addr),
            }),
            HelperCall::Range { op, r1, r3, addr } => done(match op {
                RangeOp::Stam => string::stam(cpu, bus, r1, r3, addr),
                RangeOp::Lam => string::lam(cpu, bus, r1, r3, addr),
                RangeOp::Lctl => system::lctl(cpu, bus, r1, r3, addr),
                RangeOp::Lctlg => system::lctlg(cpu, bus, r1, r3, addr),
                RangeOp::Stctl => system::stctl(cpu, bus, r1, r3, addr),
                RangeOp::Stctg => system::stctg(cpu, bus, r1, r3, addr),
                RangeOp::Cs => atomics::cs(cpu, bus, r1, r3, addr),
                RangeOp::Csg => atomics::csg(cpu, bus, r1, r3, addr),
                RangeOp::Cds => atomics::cds(cpu, bus, r1, r3, addr),
                RangeOp::Cdsg => atomics::cdsg(cpu, bus, r1, r3, addr),
                RangeOp::Mvcle => string::mvcle(cpu, bus, r1, r3, addr, limit),
                RangeOp::Clcle => string::clcle(cpu, bus, r1, r3, addr, limit),
            }),
            HelperCall::RegPair { op, r1, r2 } => match op {
                RegPairOp::Mvcl => string::mvcl(cpu, bus, r1, r2),
                RegPairOp::Clcl => string::clcl(cpu, bus, r1, r2),
                RegPairOp::Srst => done(string::srst(cpu, bus, r1, r2, limit)),
                RegPairOp::Clst => done(string::clst(cpu, bus, r1, r2, limit)),
                RegPairOp::Mvst => done(string::mvst(cpu, bus, r1, r2, limit)),
                RegPairOp::Cksm => done(string::cksm(cpu, bus, r1, r2, limit)),
                RegPairOp::Mvpg => done(string::mvpg(cpu, bus, r1, r2)),
                RegPairOp::Csp => done(atomics::csp(cpu, bus, &machine, r1, r2)),
                RegPairOp::Iske => done(system::iske(cpu, bus, r1, r2)),
                RegPairOp::Sske => done(system::sske(cpu, bus, r1, r2)),
                RegPairOp::Ipte => done(system::ipte(cpu, bus, &machine, r1, r2)),
                RegPairOp::Stura => done(system::stura(cpu, bus, r1, r2)),
                RegPairOp::Servc => done(system::servc(cpu, bus, &machine, r1, r2)),
            },
            HelperCall::RegAddr { op, r1, addr } => done(match op {
                RegAddrOp::Cvd => decimal::cvd(cpu, bus, r1, addr),
                RegAddrOp::Cvb => decimal::cvb(cpu, bus, r1, addr),
                RegAddrOp::Lra => system::lra(cpu, bus, r1, addr),
            }),
            HelperCall::Addr { op, addr } => done(match op {
                AddrOp::Sck => system::sck(cpu, bus, &machine, addr),
                AddrOp::Stck => system::stck(cpu, bus, &machine, addr),
                AddrOp::Stcke => system::stcke(cpu, bus, &machine, addr),
                AddrOp::Sckc => system::sckc(cpu, bus, addr),
                AddrOp::Stckc => system::stckc(cpu, bus, addr),
                AddrOp::Spt => system::spt(cpu, bus, &machine, addr),
                AddrOp::Stpt => system::stpt(cpu, bus, &machine, addr),
                AddrOp::Spx => system::spx(cpu, bus, addr),
                AddrOp::Stpx => system::stpx(cpu, bus, addr),
                AddrOp::Stidp => system::stidp(cpu, bus, &machine, addr),
                AddrOp::Stsi => system::stsi(cpu, bus, &machine, addr),
                AddrOp::Sacf => system::sacf(cpu, bus, addr),
                AddrOp::Lpswe => system::lpswe(cpu, bus, addr),
            }),
            HelperCall::Value { op, r1, value } => {
                let word = value as u32;
                match op {
                    ValueOp::Mlg => alu::mlg(cpu, r1, value)?,
                    ValueOp::Dlg => alu::dlg(cpu, r1, value)?,
                    ValueOp::Flogr => alu::flogr(cpu, r1, value)?,
                    ValueOp::Lpr => alu::lpr(cpu, r1, word)?,
                    ValueOp::Lpgr => alu::lpgr(cpu, r1, value)?,
                    ValueOp::Lnr => alu::lnr(cpu, r1, word),
                    ValueOp::Lngr => alu::lngr(cpu, r1, value),
                    ValueOp::Lcr => alu::lcr(cpu, r1, word)?,
                    ValueOp::Lcgr => alu::lcgr(cpu, r1, value)?,
                    ValueOp::Alc => alu::alc(cpu, r1, word),
                    ValueOp::Alcg => alu::alcg(cpu, r1, value),
                    ValueOp::Slb => alu::slb(cpu, r1, word),
                    ValueOp::Slbg => alu::slbg(cpu, r1, value),
                }
                Ok(Completion::Done)
            }
            HelperCall::MoveSpace {
                secondary,
                r1,
                r3,
                a1,
                a2,
            } => done(if secondary {
                string::mvcs(cpu, bus, r1, a1, a2, r3)
            } else {
                string::mvcp(cpu, bus, r1, a1, a2, r3)
            }),
            HelperCall::Ipm { r1 } => {
                string::ipm(cpu, r1);
                Ok(Completion::Done)
            }
            HelperCall::Rrbe { r2 } => done(system::rrbe(cpu, bus, r2)),
            HelperCall::Tprot { a1, a2 } => done(system::tprot(cpu, bus, a1, a2)),
            HelperCall::Ptlb => done(system::ptlb(cpu, bus)),
            HelperCall::Sigp { r1, r3, addr } => done(system::sigp(cpu, &machine, r1, r3, addr)),
            HelperCall::Diag { r1, r3, code } => done(system::diag(cpu, &machine, r1, r3, code)),
            HelperCall::LoadPsw { mask, addr } => {
                cpu.check_privileged()?;
                done(system::load_psw(cpu, bus, mask, addr))
            }
            HelperCall::FpReg { op, r1, r2 } => done(match op {
                FpRegOp::Aebr => fpu::aebr(cpu, r1, r2),
                FpRegOp::Adbr => fpu::adbr(cpu, r1, r2),
                FpRegOp::Axbr => fpu::axbr(cpu, r1, r2),
                FpRegOp::Sebr => fpu::sebr(cpu, r1, r2),
                FpRegOp::Sdbr => fpu::sdbr(cpu, r1, r2),
                FpRegOp::Sxbr => fpu::sxbr(cpu, r1, r2),
                FpRegOp::Meebr => fpu::meebr(cpu, r1, r2),
                FpRegOp::Mdbr => fpu::mdbr(cpu, r1, r2),
                FpRegOp::Mxbr => fpu::mxbr(cpu, r1, r2),
                FpRegOp::Debr => fpu::debr(cpu, r1, r2),
                FpRegOp::Ddbr => fpu::ddbr(cpu, r1, r2),
                FpRegOp::Dxbr => fpu::dxbr(cpu, r1, r2),
                FpRegOp::Cebr => fpu::cebr(cpu, r1, r2),
                FpRegOp::Cdbr => fpu::cdbr(cpu, r1, r2),
                FpRegOp::Cxbr => fpu::cxbr(cpu, r1, r2),
                FpRegOp::Kebr => fpu::kebr(cpu, r1, r2),
                FpRegOp::Kdbr => fpu::kdbr(cpu, r1, r2),
                FpRegOp::Kxbr => fpu::kxbr(cpu, r1, r2),
                FpRegOp::Sqebr => fpu::sqebr(cpu, r1, r2),
                FpRegOp::Sqdbr => fpu::sqdbr(cpu, r1, r2),
                FpRegOp::Sqxbr => fpu::sqxbr(cpu, r1, r2),
                FpRegOp::Ltebr => fpu::ltebr(cpu, r1, r2),
                FpRegOp::Ltdbr => fpu::ltdbr(cpu, r1, r2),
                FpRegOp::Ltxbr => fpu::ltxbr(cpu, r1, r2),
                FpRegOp::Lcebr => fpu::lcebr(cpu, r1, r2),
                FpRegOp::Lcdbr => fpu::lcdbr(cpu, r1, r2),
                FpRegOp::Lcxbr => fpu::lcxbr(cpu, r1, r2),
                FpRegOp::Lpebr => fpu::lpebr(cpu, r1, r2),
                FpRegOp::Lpdbr => fpu::lpdbr(cpu, r1, r2),
                FpRegOp::Lpxbr => fpu::lpxbr(cpu, r1, r2),
                FpRegOp::Lnebr => fpu::lnebr(cpu, r1, r2),
                FpRegOp::Lndbr => fpu::lndbr(cpu, r1, r2),
                FpRegOp::Lnxbr => fpu::lnxbr(cpu, r1, r2),
                FpRegOp::Ldebr => fpu::ldebr(cpu, r1, r2),
                FpRegOp::Lxdbr => fpu::lxdbr(cpu, r1, r2),
                FpRegOp::Lxebr => fpu::lxebr(cpu, r1, r2),
            }),
            HelperCall::FpMem { op, r1, addr } => done(match op {
                FpMemOp::Aeb => fpu::aeb(cpu, bus, r1, addr),
                FpMemOp::Adb => fpu::adb(cpu, bus, r1, addr),
                FpMemOp::Seb => fpu::seb(cpu, bus, r1, addr),
                FpMemOp::Sdb => fpu::sdb(cpu, bus, r1, addr),
                FpMemOp::Meeb => fpu::meeb(cpu, bus, r1, addr),
                FpMemOp::Mdb => fpu::mdb(cpu, bus, r1, addr),
                FpMemOp::Deb => fpu::deb(cpu, bus, r1, addr),
                FpMemOp::Ddb => fpu::ddb(cpu, bus, r1, addr),
                FpMemOp::Cdb => fpu::cdb(cpu, bus, r1, addr),
                FpMemOp::Ldeb => fpu::ldeb(cpu, bus, r1, addr),
                FpMemOp::Lxdb => fpu::lxdb(cpu, bus, r1, addr),
            }),
            HelperCall::FpRound { op, r1, r2, m3 } => done(match op {
                FpRoundOp::Ledbr => fpu::ledbr(cpu, r1, r2, m3),
                FpRoundOp::Ldxbr => fpu::ldxbr(cpu, r1, r2, m3),
                FpRoundOp::Lexbr => fpu::lexbr(cpu, r1, r2, m3),
                FpRoundOp::Cefbr => fpu::cefbr(cpu, r1, r2, m3),
                FpRoundOp::Cdfbr => fpu::cdfbr(cpu, r1, r2, m3),
                FpRoundOp::Cxfbr => fpu::cxfbr(cpu, r1, r2, m3),
                FpRoundOp::Cegbr => fpu::cegbr(cpu, r1, r2, m3),
                FpRoundOp::Cdgbr => fpu::cdgbr(cpu, r1, r2, m3),
                FpRoundOp::Cxgbr => fpu::cxgbr(cpu, r1, r2, m3),
                FpRoundOp::Cfebr => fpu::cfebr(cpu, r1, r2, m3),
                FpRoundOp::Cfdbr => fpu::cfdbr(cpu, r1, r2, m3),
                FpRoundOp::Cfxbr => fpu::cfxbr(cpu, r1, r2, m3),
                FpRoundOp::Cgebr => fpu::cgebr(cpu, r1, r2, m3),
                FpRoundOp::Cgdbr => fpu::cgdbr(cpu, r1, r2, m3),
                FpRoundOp::Cgxbr => fpu::cgxbr(cpu, r1, r2, m3),
                FpRoundOp::Fiebr => fpu::fiebr(cpu, r1, r2, m3),
                FpRoundOp::Fidbr => fpu::fidbr(cpu, r1, r2, m3),
                FpRoundOp::Fixbr => fpu::fixbr(cpu, r1, r2, m3),
            }),
            HelperCall::Fused { op, r1, r3, r2 } => done(match op {
                FusedOp::Maebr => fpu::maebr(cpu, r1, r3, r2),
                FusedOp::Madbr => fpu::madbr(cpu, r1, r3, r2),
                FusedOp::Msebr => fpu::msebr(cpu, r1, r3, r2),
                FusedOp::Msdbr => fpu::msdbr(cpu, r1, r3, r2),
            }),
            HelperCall::FusedMem { op, r1, r3, addr } => done(match op {
                FusedMemOp::Madb => fpu::madb(cpu, bus, r1, r3, addr),
                FusedMemOp::Msdb => fpu::msdb(cpu, bus, r1, r3, addr),
            }),
            HelperCall::LoadZero { precision, r1 } => {
                match precision {
                    Precision::Short => fpu::lzer(cpu, r1),
                    Precision::Long => fpu::lzdr(cpu, r1),
                    Precision::Extended => fpu::lzxr(cpu, r1)?,
                }
                Ok(Completion::Done)
            }
            HelperCall::TestDataClass {
                precision,
                r1,
                mask,
            } => done(match precision {
                Precision::Short => fpu::tceb(cpu, r1, mask),
                Precision::Long => fpu::tcdb(cpu, r1, mask),
                Precision::Extended => fpu::tcxb(cpu, r1, mask),
            }),
            HelperCall::CalcCc { op, src, dst, vr } => {
                cpu.cc = calc_cc(op, src, dst, vr);
                Ok(Completion::Done)
            }
        }
    }

    /// EXECUTE on this CPU.
    pub fn execute<D: Dispatch<PagingBus>>(
        &mut self,
        dispatch: &mut D,
        r1: usize,
        target: u64,
    ) -> Result<(), Exception> {
        ex(&mut self.state, &mut self.bus, dispatch, r1, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Machine, MachineConfig, STORAGE_INCREMENT};
    use crate::state::CpuState;
    use std::sync::Arc;

    fn vcpu() -> (Arc<Machine>, Vcpu) {
        let config = MachineConfig {
            storage_size: STORAGE_INCREMENT,
            cpu_determined_bytes: 16,
            ..MachineConfig::default()
        };
        let machine = Arc::new(Machine::new(config).unwrap());
        let v = machine.create_vcpu(0).unwrap();
        (machine, v)
    }

    #[test]
    fn storage_operations_through_the_call_enum() {
        let (machine, mut v) = vcpu();
        machine.ram().write(0x2000, b"ABC").unwrap();
        v.call(HelperCall::Ss {
            op: SsOp::Mvc,
            l: 2,
            a1: 0x1000,
            a2: 0x2000,
        })
        .unwrap();
        v.call(HelperCall::Ss {
            op: SsOp::Clc,
            l: 2,
            a1: 0x1000,
            a2: 0x2000,
        })
        .unwrap();
        assert_eq!(v.state.cc, 0);
        let mut back = [0u8; 3];
        machine.ram().read(0x1000, &mut back).unwrap();
        assert_eq!(&back, b"ABC");
    }

    #[test]
    fn long_operations_use_the_configured_chunk() {
        let (_machine, mut v) = vcpu();
        // MVCLE of 64 bytes with a 16-byte chunk ends with cc 3.
        v.state.gpr[2] = 0x1000;
        v.state.gpr[3] = 64;
        v.state.gpr[4] = 0x2000;
        v.state.gpr[5] = 64;
        v.call(HelperCall::Range {
            op: RangeOp::Mvcle,
            r1: 2,
            r3: 4,
            addr: 0,
        })
        .unwrap();
        assert_eq!(v.state.cc, 3);
        assert_eq!(v.state.gpr[3], 48);
    }

    #[test]
    fn value_and_cc_calls() {
        let (_machine, mut v) = vcpu();
        v.call(HelperCall::Value {
            op: ValueOp::Lcgr,
            r1: 1,
            value: 5,
        })
        .unwrap();
        assert_eq!(v.state.gpr[1] as i64, -5);
        assert_eq!(v.state.cc, 1);
        v.call(HelperCall::CalcCc {
            op: CcOp::Static,
            src: 0,
            dst: 2,
            vr: 0,
        })
        .unwrap();
        assert_eq!(v.state.cc, 2);
    }

    #[test]
    fn floating_point_calls() {
        let (_machine, mut v) = vcpu();
        v.state.fpr[0] = 1.5f64.to_bits();
        v.state.fpr[2] = 2.25f64.to_bits();
        v.call(HelperCall::FpReg {
            op: FpRegOp::Adbr,
            r1: 0,
            r2: 2,
        })
        .unwrap();
        assert_eq!(f64::from_bits(v.state.fpr[0]), 3.75);
        assert_eq!(v.state.cc, 2);
        v.call(HelperCall::LoadZero {
            precision: Precision::Long,
            r1: 0,
        })
        .unwrap();
        assert_eq!(v.state.fpr[0], 0);
    }

    #[test]
    fn exceptions_propagate_and_deliver() {
        let (machine, mut v) = vcpu();
        let new_mask = (crate::state::PswMask::EA | crate::state::PswMask::BA).bits();
        machine
            .ram()
            .write_u64_be(crate::interrupts::lowcore::PROGRAM_NEW_PSW, new_mask)
            .unwrap();
        machine
            .ram()
            .write_u64_be(crate::interrupts::lowcore::PROGRAM_NEW_PSW + 8, 0x6000)
            .unwrap();
        let err = v
            .call(HelperCall::Range {
                op: RangeOp::Cs,
                r1: 1,
                r3: 2,
                addr: 0x1002,
            })
            .unwrap_err();
        assert_eq!(err, Exception::Specification);
        v.raise(err, 4).unwrap();
        assert_eq!(v.state.psw.addr, 0x6000);
    }

    #[test]
    fn decimal_calls_ignore_high_length_bits() {
        let (machine, mut v) = vcpu();
        machine.ram().write(0x2000, &[0xf1, 0xf2, 0xf3, 0xc4]).unwrap();
        v.call(HelperCall::Decimal {
            op: DecimalOp::Pack,
            l1: 0x1f,
            l2: 3,
            a1: 0x1000,
            a2: 0x2000,
        })
        .unwrap();
        let mut packed = [0u8; 16];
        machine.ram().read(0x1000, &mut packed).unwrap();
        assert_eq!(&packed[13..], &[0x01, 0x23, 0x4c]);
        assert!(packed[..13].iter().all(|&b| b == 0));
    }

    #[test]
    fn execute_through_the_vcpu() {
        let (machine, mut v) = vcpu();
        machine.ram().write(0x1000, &[0x07, 0x00]).unwrap();
        v.state.gpr[1] = 0xf3;
        let mut seen = None;
        let mut dispatch =
            |_: &mut CpuState, _: &mut PagingBus, insn: &crate::exec::Insn| -> Result<(), Exception> {
                seen = Some(insn.bytes[1]);
                Ok(())
            };
        v.execute(&mut dispatch, 1, 0x1000).unwrap();
        assert_eq!(seen, Some(0xf3));
    }
}
