//! Graph-coloring register allocation.
//!
//! Live ranges come from backward dataflow; the interference graph is
//! built over virtual registers, with conflict edges against the physical
//! registers the calling convention pins (calls clobber the caller-saved
//! set).  Moves are coalesced conservatively: Briggs for a pair of virtual
//! registers, George when one side is precolored, which is what lets a
//! parameter flow straight through to its ABI register.  When simplify
//! gets stuck, the cheapest candidate is pushed optimistically; a failed
//! optimistic node is spilled to a stack slot, rewritten with fresh
//! single-use registers, and the whole round restarts.

use log::{debug, trace};

use crate::back::arch::{Arch, CodegenError, MFunction, MInst, Operand, Reg};
use crate::back::frame::Frame;
use crate::common::{Map, Set};
use crate::middle::ir::Vreg;

/// Block-level liveness by backward dataflow:
/// `live_in = gen ∪ (live_out \ kill)`, `live_out = ∪ live_in(succ)`.
pub fn block_liveness<R: Copy + Ord>(func: &MFunction<R>) -> (Vec<Set<R>>, Vec<Set<R>>) {
    let n = func.blocks.len();
    let mut gen: Vec<Set<R>> = vec![Set::new(); n];
    let mut kill: Vec<Set<R>> = vec![Set::new(); n];
    for (bi, block) in func.blocks.iter().enumerate() {
        for inst in &block.insts {
            for u in inst.uses() {
                if !kill[bi].contains(&u) {
                    gen[bi].insert(u);
                }
            }
            for d in inst.defs() {
                kill[bi].insert(d);
            }
        }
    }
    let mut live_in: Vec<Set<R>> = vec![Set::new(); n];
    let mut live_out: Vec<Set<R>> = vec![Set::new(); n];
    let mut changed = true;
    while changed {
        changed = false;
        for bi in (0..n).rev() {
            let mut out = Set::new();
            for succ in func.blocks[bi].succs() {
                if let Some(si) = func.block_index(succ) {
                    out.extend(live_in[si].iter().copied());
                }
            }
            let mut inn: Set<R> = out.difference(&kill[bi]).copied().collect();
            inn.extend(gen[bi].iter().copied());
            if inn != live_in[bi] || out != live_out[bi] {
                live_in[bi] = inn;
                live_out[bi] = out;
                changed = true;
            }
        }
    }
    (live_in, live_out)
}

struct Graph {
    /// Virtual-virtual interference, symmetric.
    adj: Map<Vreg, Set<Vreg>>,
    /// Physical registers each virtual register may not share.
    phys: Map<Vreg, Set<Reg>>,
    /// Move-related pairs, in instruction order.
    moves: Vec<(Operand, Operand)>,
    /// Weighted occurrence count per virtual register.
    cost: Map<Vreg, u32>,
}

impl Graph {
    fn add_edge(&mut self, a: Operand, b: Operand) {
        match (a, b) {
            _ if a == b => {}
            (Operand::Virt(x), Operand::Virt(y)) => {
                self.adj.entry(x).or_default().insert(y);
                self.adj.entry(y).or_default().insert(x);
            }
            (Operand::Virt(x), Operand::Phys(p)) | (Operand::Phys(p), Operand::Virt(x)) => {
                self.phys.entry(x).or_default().insert(p);
            }
            (Operand::Phys(_), Operand::Phys(_)) => {}
        }
    }
}

fn build_graph<A: Arch>(arch: &A, func: &MFunction<Operand>) -> Graph {
    let mut graph = Graph { adj: Map::new(), phys: Map::new(), moves: Vec::new(), cost: Map::new() };
    let (_, live_out) = block_liveness(func);

    for (bi, block) in func.blocks.iter().enumerate() {
        let weight = 10u32.saturating_pow(block.loop_depth.min(4));
        let mut live = live_out[bi].clone();
        for inst in block.insts.iter().rev() {
            let defs = inst.defs();
            let uses = inst.uses();
            for o in defs.iter().chain(&uses) {
                if let Operand::Virt(v) = o {
                    *graph.cost.entry(*v).or_default() += weight;
                    graph.adj.entry(*v).or_default();
                }
            }

            let as_move = inst.as_move();
            if let Some(pair) = as_move {
                graph.moves.push(pair);
            }
            for &d in &defs {
                for &l in &live {
                    if as_move.map_or(false, |(_, src)| l == src) {
                        continue;
                    }
                    graph.add_edge(d, l);
                }
            }
            // A call tramples every caller-saved register; anything live
            // across it must not end up in one.
            if let MInst::VCall { ret, .. } = inst {
                for &clobber in arch.caller_saved() {
                    for &l in &live {
                        // The return value is defined by the call itself,
                        // not live across it.
                        if Some(l) == *ret {
                            continue;
                        }
                        graph.add_edge(Operand::Phys(clobber), l);
                    }
                }
            }
            for d in defs {
                live.remove(&d);
            }
            for u in uses {
                live.insert(u);
            }
        }
    }
    graph
}

/// Assign a physical register to every virtual register of `func`,
/// spilling through `frame` as needed.
pub fn allocate<A: Arch>(
    arch: &A,
    mut func: MFunction<Operand>,
    frame: &mut Frame,
) -> Result<MFunction<Reg>, CodegenError> {
    let pool: Vec<Reg> = arch.register_classes()[0].pool.to_vec();
    let k = pool.len();
    let word = arch.word_size();

    let mut next_vreg = max_vreg(&func);
    let mut no_spill: Set<Vreg> = Set::new();
    let mut rounds = 0usize;
    let limit = next_vreg as usize + 2;

    loop {
        rounds += 1;
        if rounds > limit {
            return Err(CodegenError::Alloc(format!(
                "{} did not converge after {rounds} rounds",
                func.name
            )));
        }

        let mut graph = build_graph(arch, &func);

        // Conservative coalescing over the move list.
        let mut parent: Map<Vreg, Vreg> = Map::new();
        let mut phys_alias: Map<Vreg, Reg> = Map::new();
        let moves = graph.moves.clone();
        for (dst, src) in moves {
            coalesce(&mut graph, &mut parent, &mut phys_alias, &pool, k, dst, src);
        }

        // Simplify: remove low-degree nodes; push a cheap candidate
        // optimistically when none qualifies.
        let mut degrees: Map<Vreg, usize> = Map::new();
        let mut neighbors: Map<Vreg, Set<Vreg>> = Map::new();
        for (&v, adj) in &graph.adj {
            if find(&mut parent, v) != v || phys_alias.contains_key(&v) {
                continue;
            }
            let mut ns: Set<Vreg> = Set::new();
            for &n in adj {
                let n = find(&mut parent, n);
                if n != v && !phys_alias.contains_key(&n) {
                    ns.insert(n);
                }
            }
            let pool_conflicts = graph
                .phys
                .get(&v)
                .map_or(0, |s| s.iter().filter(|p| pool.contains(p)).count());
            degrees.insert(v, ns.len() + pool_conflicts);
            neighbors.insert(v, ns);
        }

        let mut stack: Vec<(Vreg, bool)> = Vec::new();
        let mut remaining: Set<Vreg> = degrees.keys().copied().collect();
        while !remaining.is_empty() {
            let simple = remaining.iter().copied().find(|v| degrees[v] < k);
            let (v, optimistic) = match simple {
                Some(v) => (v, false),
                None => {
                    // Spill choice: lowest weighted occurrence count per
                    // degree, skipping registers born from earlier spills.
                    let candidate = remaining
                        .iter()
                        .copied()
                        .filter(|v| !no_spill.contains(v))
                        .min_by_key(|v| {
                            (graph.cost.get(v).copied().unwrap_or(0), usize::MAX - degrees[v])
                        });
                    match candidate {
                        Some(v) => (v, true),
                        None => {
                            return Err(CodegenError::Alloc(format!(
                                "{}: all high-degree registers are spill temporaries",
                                func.name
                            )))
                        }
                    }
                }
            };
            remaining.remove(&v);
            stack.push((v, optimistic));
            for n in neighbors[&v].clone() {
                if let Some(d) = degrees.get_mut(&n) {
                    *d = d.saturating_sub(1);
                }
            }
        }

        // Select: pop and color; a failed optimistic node becomes a real
        // spill.
        let mut colors: Map<Vreg, Reg> = Map::new();
        let mut spills: Vec<Vreg> = Vec::new();
        for (v, optimistic) in stack.into_iter().rev() {
            let mut forbidden: Set<Reg> = graph.phys.get(&v).cloned().unwrap_or_default();
            for n in &neighbors[&v] {
                if let Some(&c) = colors.get(n) {
                    forbidden.insert(c);
                }
            }
            match pool.iter().copied().find(|c| !forbidden.contains(c)) {
                Some(c) => {
                    colors.insert(v, c);
                }
                None => {
                    debug_assert!(optimistic, "non-optimistic node failed to color");
                    spills.push(v);
                }
            }
        }

        if spills.is_empty() {
            debug!("allocated {} in {rounds} round(s)", func.name);
            let resolve = |o: Operand| -> Reg {
                match o {
                    Operand::Phys(p) => p,
                    Operand::Virt(v) => {
                        let r = find_immutable(&parent, v);
                        phys_alias.get(&r).copied().unwrap_or_else(|| colors[&r])
                    }
                }
            };
            for c in colors.values() {
                if pool.contains(c) {
                    frame.used_callee_saved.insert(*c);
                }
            }
            let mut out = MFunction { name: func.name, blocks: Vec::new() };
            for block in func.blocks {
                let mut insts = Vec::with_capacity(block.insts.len());
                for inst in block.insts {
                    let inst = inst.map_regs(&resolve);
                    // Coalesced moves collapse into nothing.
                    if let Some((d, s)) = inst.as_move() {
                        if d == s {
                            continue;
                        }
                    }
                    insts.push(inst);
                }
                out.blocks.push(crate::back::arch::MBlock {
                    label: block.label,
                    insts,
                    loop_depth: block.loop_depth,
                });
            }
            return Ok(out);
        }

        // Rewrite the spilled registers and run another round.
        trace!("{}: spilling {spills:?}", func.name);
        for v in spills {
            let slot = frame.spill_slot(word);
            rewrite_spill(&mut func, v, slot, &mut next_vreg, &mut no_spill);
        }
    }
}

fn coalesce(
    graph: &mut Graph,
    parent: &mut Map<Vreg, Vreg>,
    phys_alias: &mut Map<Vreg, Reg>,
    pool: &[Reg],
    k: usize,
    dst: Operand,
    src: Operand,
) {
    let resolve = |o: Operand, parent: &mut Map<Vreg, Vreg>, phys_alias: &Map<Vreg, Reg>| match o {
        Operand::Phys(p) => Operand::Phys(p),
        Operand::Virt(v) => {
            let r = find(parent, v);
            match phys_alias.get(&r) {
                Some(&p) => Operand::Phys(p),
                None => Operand::Virt(r),
            }
        }
    };
    let a = resolve(dst, parent, phys_alias);
    let b = resolve(src, parent, phys_alias);

    let degree_of = |graph: &Graph, parent: &mut Map<Vreg, Vreg>, v: Vreg| -> usize {
        let mut ns: Set<Vreg> = Set::new();
        if let Some(adj) = graph.adj.get(&v) {
            for &n in adj {
                ns.insert(find(parent, n));
            }
        }
        ns.remove(&v);
        let pc = graph.phys.get(&v).map_or(0, |s| s.iter().filter(|p| pool.contains(p)).count());
        ns.len() + pc
    };

    match (a, b) {
        (Operand::Virt(x), Operand::Virt(y)) if x != y => {
            if graph.adj.get(&x).is_some_and(|s| s.iter().any(|&n| find(parent, n) == y)) {
                return;
            }
            // Briggs: the merged node must have fewer than K significant
            // neighbors.
            let mut significant = 0;
            let mut seen: Set<Vreg> = Set::new();
            for &n in graph.adj.get(&x).into_iter().flatten().chain(graph.adj.get(&y).into_iter().flatten()) {
                let n = find(parent, n);
                if n == x || n == y || !seen.insert(n) {
                    continue;
                }
                if degree_of(graph, parent, n) >= k {
                    significant += 1;
                }
            }
            let merged_phys: Set<Reg> = graph
                .phys
                .get(&x)
                .into_iter()
                .chain(graph.phys.get(&y))
                .flatten()
                .copied()
                .collect();
            significant += merged_phys.iter().filter(|p| pool.contains(p)).count();
            if significant >= k {
                return;
            }
            // Merge y into x.
            parent.insert(y, x);
            let y_adj = graph.adj.get(&y).cloned().unwrap_or_default();
            for n in y_adj {
                graph.adj.entry(x).or_default().insert(n);
                graph.adj.entry(n).or_default().insert(x);
            }
            graph.phys.entry(x).or_default().extend(merged_phys);
            let y_cost = graph.cost.get(&y).copied().unwrap_or(0);
            *graph.cost.entry(x).or_default() += y_cost;
            trace!("coalesced {y} into {x}");
        }
        (Operand::Virt(v), Operand::Phys(p)) | (Operand::Phys(p), Operand::Virt(v)) => {
            if graph.phys.get(&v).is_some_and(|s| s.contains(&p)) {
                return;
            }
            // George: every neighbor of v must either be insignificant or
            // already conflict with p.
            let neighbors: Vec<Vreg> = graph
                .adj
                .get(&v)
                .into_iter()
                .flatten()
                .map(|&n| find(parent, n))
                .filter(|&n| n != v)
                .collect();
            for t in neighbors {
                if phys_alias.get(&t) == Some(&p) {
                    return;
                }
                let conflicts = graph.phys.get(&t).is_some_and(|s| s.contains(&p));
                if degree_of(graph, parent, t) >= k && !conflicts {
                    return;
                }
            }
            phys_alias.insert(v, p);
            // v's interferences become conflicts with p.
            let adj = graph.adj.get(&v).cloned().unwrap_or_default();
            for n in adj {
                let n = find(parent, n);
                graph.phys.entry(n).or_default().insert(p);
            }
            trace!("coalesced {v} into {p}");
        }
        _ => {}
    }
}

fn find(parent: &mut Map<Vreg, Vreg>, v: Vreg) -> Vreg {
    let mut root = v;
    while let Some(&p) = parent.get(&root) {
        if p == root {
            break;
        }
        root = p;
    }
    if root != v {
        parent.insert(v, root);
    }
    root
}

fn find_immutable(parent: &Map<Vreg, Vreg>, v: Vreg) -> Vreg {
    let mut root = v;
    while let Some(&p) = parent.get(&root) {
        if p == root {
            break;
        }
        root = p;
    }
    root
}

fn max_vreg(func: &MFunction<Operand>) -> u32 {
    let mut max = 0;
    for block in &func.blocks {
        for inst in &block.insts {
            for o in inst.defs().into_iter().chain(inst.uses()) {
                if let Operand::Virt(v) = o {
                    max = max.max(v.0 + 1);
                }
            }
        }
    }
    max
}

/// Replace every use of `v` with a load from its slot into a fresh
/// register, and every definition with a store from one.  The fresh
/// registers have single-instruction ranges and are exempt from further
/// spilling.
fn rewrite_spill(
    func: &mut MFunction<Operand>,
    v: Vreg,
    slot: usize,
    next_vreg: &mut u32,
    no_spill: &mut Set<Vreg>,
) {
    for block in &mut func.blocks {
        let old = std::mem::take(&mut block.insts);
        let mut insts = Vec::with_capacity(old.len());
        for inst in old {
            let used = inst.uses().contains(&Operand::Virt(v));
            let defined = inst.defs().contains(&Operand::Virt(v));
            if !used && !defined {
                insts.push(inst);
                continue;
            }
            let use_reg = Vreg(*next_vreg);
            let def_reg = Vreg(*next_vreg + 1);
            *next_vreg += 2;
            if used {
                no_spill.insert(use_reg);
                insts.push(MInst::LoadSlot { dst: Operand::Virt(use_reg), slot });
            }
            if defined {
                no_spill.insert(def_reg);
            }
            // Constant materialization can read and write the same
            // register in one instruction, so map positionally.
            let inst = inst.map_uses_defs(
                |o| if o == Operand::Virt(v) { Operand::Virt(use_reg) } else { o },
                |o| if o == Operand::Virt(v) { Operand::Virt(def_reg) } else { o },
            );
            insts.push(inst);
            if defined {
                insts.push(MInst::StoreSlot { src: Operand::Virt(def_reg), slot });
            }
        }
        block.insts = insts;
    }
}
