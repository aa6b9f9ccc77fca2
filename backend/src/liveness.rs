use tcg_core::helper::HelperFlags;
use tcg_core::op::{LifeData, Op};
use tcg_core::temp::{TempIdx, TempKind};
use tcg_core::{Context, OpFlags, Opcode, OPCODE_DEFS};

/// Perform backward liveness analysis over the IR ops in `ctx`.
///
/// Walks the op list from last to first, maintaining two bit-arrays of
/// length `nb_temps`: `dead[t]` (no live consumer remains after the point
/// currently being considered) and `mem_stale[t]` (the in-memory copy may
/// not reflect the live register value). Besides annotating each op's
/// `life` field with per-argument dead/sync bits, this pass deletes ops
/// whose results are entirely unused (rewriting them to `Nop`, which
/// `regalloc_and_codegen` already skips) and rewrites `add2`/`sub2`/
/// `mulu2`/`muls2` down to their single-width scalar form when the high
/// output is dead.
pub fn liveness_analysis(ctx: &mut Context) {
    let nb_temps = ctx.nb_temps() as usize;
    let nb_globals = ctx.nb_globals() as usize;

    // dead[t] = true: temp t has no pending use at this point in the
    // backward scan. mem_stale[t] = true: the register copy is ahead of
    // the memory copy.
    let mut dead = vec![true; nb_temps];
    let mut mem_stale = vec![false; nb_temps];

    let num_ops = ctx.num_ops();

    for oi in (0..num_ops).rev() {
        let op = ctx.ops()[oi].clone();

        if op.opc == Opcode::InsnStart {
            continue;
        }

        if op.opc == Opcode::Discard {
            let tidx = op.args[0].0 as usize;
            if tidx < nb_temps {
                dead[tidx] = true;
                mem_stale[tidx] = false;
            }
            continue;
        }

        if let Some(scalar) = scalar_replacement(op.opc) {
            let rl = op.args[0].0 as usize;
            let rh = op.args[1].0 as usize;
            let lo_dead = rl >= nb_temps || (dead[rl] && !mem_stale[rl]);
            let hi_dead = rh >= nb_temps || (dead[rh] && !mem_stale[rh]);

            if lo_dead && hi_dead {
                ctx.op_mut(op.idx).opc = Opcode::Nop;
                if rl < nb_temps {
                    dead[rl] = true;
                    mem_stale[rl] = false;
                }
                if rh < nb_temps {
                    dead[rh] = true;
                    mem_stale[rh] = false;
                }
                continue;
            }
            if hi_dead {
                let mut narrowed = op.clone();
                rewrite_to_scalar(&mut narrowed, scalar);
                let life = process_generic(
                    &narrowed,
                    &OPCODE_DEFS[scalar as usize].flags,
                    nb_temps,
                    nb_globals,
                    &mut dead,
                    &mut mem_stale,
                    ctx,
                );
                let op_mut = ctx.op_mut(op.idx);
                *op_mut = narrowed;
                op_mut.life = life;
                continue;
            }
        }

        let def = &OPCODE_DEFS[op.opc as usize];
        let flags = def.flags;

        if op.opc == Opcode::Call {
            liveness_call(&op, nb_temps, nb_globals, &mut dead, &mut mem_stale, ctx);
            continue;
        }

        // BB_END: before folding this op's own args, the *next* (earlier
        // in program order) iteration sees the basic-block-end state —
        // globals and temp_local temps forced live and in memory, every
        // other scratch temp dead.
        if flags.contains(OpFlags::BB_END) {
            for t in 0..nb_globals {
                dead[t] = false;
                mem_stale[t] = false;
            }
            for (i, temp) in ctx.temps().iter().enumerate().skip(nb_globals) {
                if temp.kind == TempKind::Tb {
                    dead[i] = false;
                    mem_stale[i] = false;
                } else {
                    dead[i] = true;
                }
            }
        }

        let nb_oargs = op.nb_oargs();
        let any_output_live =
            (0..nb_oargs).any(|i| {
                let t = op.args[i].0 as usize;
                t < nb_temps && !dead[t]
            });
        // CARRY_OUT ops leave their real result in the host's flags
        // register, which a later CARRY_IN op may consume without that
        // dependency ever showing up as a temp use. Deleting a dead-output
        // CARRY_OUT op would let an unrelated instruction land between the
        // two and clobber the flag before it's read.
        if nb_oargs > 0
            && !any_output_live
            && !flags.contains(OpFlags::SIDE_EFFECTS)
            && !flags.contains(OpFlags::CARRY_OUT)
        {
            ctx.op_mut(op.idx).opc = Opcode::Nop;
            continue;
        }

        let life = process_generic(&op, &flags, nb_temps, nb_globals, &mut dead, &mut mem_stale, ctx);
        ctx.op_mut(op.idx).life = life;
    }
}

/// Fold one non-Call op's outputs then inputs into `dead`/`mem_stale`,
/// returning the computed `LifeData`. Shared between the main loop and
/// the add2/sub2/mulu2/muls2 high-half rewrite path.
fn process_generic(
    op: &Op,
    flags: &OpFlags,
    nb_temps: usize,
    nb_globals: usize,
    dead: &mut [bool],
    mem_stale: &mut [bool],
    ctx: &Context,
) -> LifeData {
    let mut life = LifeData::default();
    let nb_oargs = op.nb_oargs();
    let nb_iargs = op.nb_iargs();

    fold_outputs(op, nb_oargs, dead, mem_stale, nb_temps, &mut life);

    if flags.contains(OpFlags::SIDE_EFFECTS) {
        for t in mem_stale.iter_mut().take(nb_globals) {
            *t = true;
        }
    }

    fold_inputs(op, nb_oargs, nb_iargs, dead, nb_temps, ctx, &mut life);
    life
}

fn liveness_call(
    op: &Op,
    nb_temps: usize,
    nb_globals: usize,
    dead: &mut [bool],
    mem_stale: &mut [bool],
    ctx: &mut Context,
) {
    let nb_oargs = op.nb_oargs();
    let nb_iargs = op.nb_iargs();
    let cstart = nb_oargs + nb_iargs;
    let func_lo = op.args[cstart].0 as u64;
    let func_hi = op.args[cstart + 1].0 as u64;
    let addr = (func_hi << 32) | func_lo;
    let hflags = ctx
        .helpers
        .lookup(addr)
        .map(|info| info.flags)
        .unwrap_or(HelperFlags::NONE);

    let outputs_dead_fresh = (0..nb_oargs).all(|i| {
        let t = op.args[i].0 as usize;
        t >= nb_temps || (dead[t] && !mem_stale[t])
    });

    if hflags.contains(HelperFlags::NO_SIDE_EFFECTS) && outputs_dead_fresh {
        ctx.op_mut(op.idx).opc = Opcode::Nop;
        return;
    }

    let mut life = LifeData::default();
    fold_outputs(op, nb_oargs, dead, mem_stale, nb_temps, &mut life);

    if !hflags.contains(HelperFlags::NO_READ_GLOBALS) {
        for t in mem_stale.iter_mut().take(nb_globals) {
            *t = true;
        }
    }
    if !hflags.contains(HelperFlags::NO_WRITE_GLOBALS) {
        for t in dead.iter_mut().take(nb_globals) {
            *t = true;
        }
    }

    fold_inputs(op, nb_oargs, nb_iargs, dead, nb_temps, ctx, &mut life);

    ctx.op_mut(op.idx).life = life;
}

fn fold_outputs(
    op: &Op,
    nb_oargs: usize,
    dead: &mut [bool],
    mem_stale: &mut [bool],
    nb_temps: usize,
    life: &mut LifeData,
) {
    for i in 0..nb_oargs {
        let tidx = op.args[i].0 as usize;
        if tidx >= nb_temps {
            continue;
        }
        if dead[tidx] {
            life.set_dead(i as u32);
        }
        if mem_stale[tidx] {
            life.set_sync(i as u32);
        }
        dead[tidx] = true;
        mem_stale[tidx] = false;
    }
}

fn fold_inputs(
    op: &Op,
    nb_oargs: usize,
    nb_iargs: usize,
    dead: &mut [bool],
    nb_temps: usize,
    ctx: &Context,
    life: &mut LifeData,
) {
    for i in 0..nb_iargs {
        let arg_pos = nb_oargs + i;
        let tidx = op.args[arg_pos].0 as usize;
        if tidx >= nb_temps {
            continue;
        }
        if dead[tidx] {
            life.set_dead(arg_pos as u32);
            if ctx.temp(TempIdx(tidx as u32)).kind == TempKind::Global {
                life.set_sync(arg_pos as u32);
            }
        }
        dead[tidx] = false;
    }
}

/// Scalar opcode to rewrite to when the high output of a double-width op
/// is dead. Only the genuine 2-output widening ops need this — `mulsh`/
/// `muluh` already produce a single result and fall out via the generic
/// dead-output deletion rule instead.
fn scalar_replacement(opc: Opcode) -> Option<Opcode> {
    match opc {
        Opcode::Add2 => Some(Opcode::Add),
        Opcode::Sub2 => Some(Opcode::Sub),
        Opcode::MulU2 | Opcode::MulS2 => Some(Opcode::Mul),
        _ => None,
    }
}

/// Compact a double-width op's args down to its scalar replacement's
/// layout (1 output, 2 inputs) in place.
fn rewrite_to_scalar(op: &mut Op, scalar: Opcode) {
    let new_args = match op.opc {
        Opcode::Add2 | Opcode::Sub2 => [op.args[0], op.args[2], op.args[4]],
        Opcode::MulU2 | Opcode::MulS2 => [op.args[0], op.args[2], op.args[3]],
        _ => unreachable!("rewrite_to_scalar: not a double-width op"),
    };
    op.opc = scalar;
    op.args[0] = new_args[0];
    op.args[1] = new_args[1];
    op.args[2] = new_args[2];
}
