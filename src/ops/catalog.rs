use crate::ops::{cs, elem, ts, Domain, OpCode, OpKernel};
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: usize,
}

impl Arity {
    pub const fn exact(n: usize) -> Self {
        Self { min: n, max: n }
    }

    pub const fn range(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    #[inline]
    pub const fn accepts(self, n: usize) -> bool {
        n >= self.min && n <= self.max
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpMeta {
    /// Operator name, also the prefix of node display names.
    pub name: &'static str,
    pub op: OpCode,
    /// Decides the default grouping: cross-section ops group by date, the rest by asset.
    pub domain: Domain,
    /// Accepted operand count (factors and scalars).
    pub arity: Arity,
    /// Smallest window the builder accepts; 1 for single-step ops.
    pub min_win: usize,
    /// Output count per cell; 0 when the data decides it.
    pub outputs: usize,
    pub kernel: OpKernel,
}

pub struct OperatorRegistry;

impl OperatorRegistry {
    pub fn get(name: &str) -> Option<&'static OpMeta> {
        let index = REGISTRY_INDEX.get_or_init(build_registry_index);
        index.by_name.get(name).map(|idx| &OP_METAS[*idx])
    }

    pub fn get_by_op(op: OpCode) -> &'static OpMeta {
        let index = REGISTRY_INDEX.get_or_init(build_registry_index);
        &OP_METAS[index.by_op[op.as_usize()]]
    }

    pub fn all() -> &'static [OpMeta] {
        &OP_METAS
    }
}

struct RegistryIndex {
    by_name: HashMap<&'static str, usize>,
    by_op: [usize; OpCode::COUNT],
}

static REGISTRY_INDEX: OnceLock<RegistryIndex> = OnceLock::new();
const MISSING_IDX: usize = usize::MAX;

fn build_registry_index() -> RegistryIndex {
    let mut by_name = HashMap::with_capacity(OP_METAS.len());
    let mut by_op = [MISSING_IDX; OpCode::COUNT];
    for (idx, meta) in OP_METAS.iter().enumerate() {
        if meta.arity.min > meta.arity.max || meta.min_win == 0 {
            panic!("operator `{}` has an invalid meta entry", meta.name);
        }
        if meta.domain == Domain::Ts && meta.min_win < 2 {
            panic!("rolling operator `{}` must require win >= 2", meta.name);
        }
        if by_name.insert(meta.name, idx).is_some() {
            panic!("duplicate operator name in registry: {}", meta.name);
        }
        let slot = meta.op.as_usize();
        if by_op[slot] != MISSING_IDX {
            panic!("duplicate opcode in registry: {:?}", meta.op);
        }
        by_op[slot] = idx;
    }
    if let Some(slot) = by_op.iter().position(|idx| *idx == MISSING_IDX) {
        panic!("opcode slot not registered: {slot}");
    }
    RegistryIndex { by_name, by_op }
}

const fn elem(name: &'static str, op: OpCode, arity: Arity, kernel: OpKernel) -> OpMeta {
    OpMeta {
        name,
        op,
        domain: Domain::Elem,
        arity,
        min_win: 1,
        outputs: 1,
        kernel,
    }
}

const fn rolling(name: &'static str, op: OpCode, arity: usize, kernel: OpKernel) -> OpMeta {
    OpMeta {
        name,
        op,
        domain: Domain::Ts,
        arity: Arity::exact(arity),
        min_win: 2,
        outputs: 1,
        kernel,
    }
}

const fn cross(name: &'static str, op: OpCode, arity: Arity, kernel: OpKernel) -> OpMeta {
    OpMeta {
        name,
        op,
        domain: Domain::Cs,
        arity,
        min_win: 1,
        outputs: 1,
        kernel,
    }
}

const UNARY: Arity = Arity::exact(1);
const BINARY: Arity = Arity::exact(2);

static OP_METAS: [OpMeta; OpCode::COUNT] = [
    elem("add", OpCode::ElemAdd, BINARY, elem::elem_add),
    elem("sub", OpCode::ElemSub, BINARY, elem::elem_sub),
    elem("mul", OpCode::ElemMul, BINARY, elem::elem_mul),
    elem("div", OpCode::ElemDiv, BINARY, elem::elem_div),
    elem("mod", OpCode::ElemMod, BINARY, elem::elem_mod),
    elem("pow", OpCode::ElemPow, BINARY, elem::elem_pow),
    elem("neg", OpCode::ElemNeg, UNARY, elem::elem_neg),
    elem("abs", OpCode::ElemAbs, UNARY, elem::elem_abs),
    elem("log", OpCode::ElemLog, UNARY, elem::elem_log),
    elem("sign", OpCode::ElemSign, UNARY, elem::elem_sign),
    elem("lt", OpCode::ElemLt, BINARY, elem::elem_lt),
    elem("le", OpCode::ElemLe, BINARY, elem::elem_le),
    elem("gt", OpCode::ElemGt, BINARY, elem::elem_gt),
    elem("ge", OpCode::ElemGe, BINARY, elem::elem_ge),
    elem("eq", OpCode::ElemEq, BINARY, elem::elem_eq),
    elem("ne", OpCode::ElemNe, BINARY, elem::elem_ne),
    elem("and", OpCode::ElemAnd, BINARY, elem::elem_and),
    elem("or", OpCode::ElemOr, BINARY, elem::elem_or),
    elem("not", OpCode::ElemNot, UNARY, elem::elem_not),
    elem("fill_na", OpCode::ElemFillNa, UNARY, elem::elem_fillna),
    elem("masked_fill", OpCode::ElemMaskedFill, BINARY, elem::elem_masked_fill),
    elem("clamp", OpCode::ElemClamp, UNARY, elem::elem_clamp),
    elem("filter", OpCode::ElemFilter, UNARY, elem::elem_filter),
    elem("shift", OpCode::ElemShift, UNARY, elem::elem_shift),
    elem("pad", OpCode::ElemPad, UNARY, elem::elem_pad),
    elem("adjusted", OpCode::ElemAdjusted, UNARY, elem::elem_adjusted),
    elem("select", OpCode::ElemSelect, UNARY, elem::elem_select),
    elem("to_float", OpCode::ElemToFloat, UNARY, elem::elem_to_float),
    OpMeta {
        name: "one_hot",
        op: OpCode::ElemOneHot,
        domain: Domain::Elem,
        arity: UNARY,
        min_win: 1,
        outputs: 0,
        kernel: elem::elem_one_hot,
    },
    rolling("ts_sum", OpCode::TsSum, 1, ts::ts_sum),
    rolling("ts_product", OpCode::TsProduct, 1, ts::ts_product),
    rolling("ts_mean", OpCode::TsMean, 1, ts::ts_mean),
    rolling("ts_std", OpCode::TsStd, 1, ts::ts_std),
    rolling("ts_var", OpCode::TsVar, 1, ts::ts_var),
    rolling("ts_max", OpCode::TsMax, 1, ts::ts_max),
    rolling("ts_min", OpCode::TsMin, 1, ts::ts_min),
    rolling("ts_count", OpCode::TsCount, 1, ts::ts_count),
    rolling("ts_rank", OpCode::TsRank, 1, ts::ts_rank),
    rolling("returns", OpCode::TsReturns, 1, ts::ts_returns),
    rolling("ts_any", OpCode::TsAny, 1, ts::ts_any),
    rolling("ts_all", OpCode::TsAll, 1, ts::ts_all),
    rolling("ts_corr", OpCode::TsCorr, 2, ts::ts_corr),
    rolling("ts_cov", OpCode::TsCov, 2, ts::ts_cov),
    OpMeta {
        name: "linear_regression",
        op: OpCode::TsLinearRegression,
        domain: Domain::Ts,
        arity: BINARY,
        min_win: 2,
        outputs: 2,
        kernel: ts::ts_linear_regression,
    },
    cross("rank", OpCode::CsRank, UNARY, cs::cs_rank),
    cross("zscore", OpCode::CsZscore, Arity::range(1, 2), cs::cs_zscore),
    cross("demean", OpCode::CsDemean, UNARY, cs::cs_demean),
    cross("quantile", OpCode::CsQuantile, UNARY, cs::cs_quantile),
    cross("to_weight", OpCode::CsToWeight, UNARY, cs::cs_to_weight),
    cross("winsorize", OpCode::CsWinsorize, UNARY, cs::cs_winsorize),
    cross("mad_clamp", OpCode::CsMadClamp, UNARY, cs::cs_mad_clamp),
    cross("group_demean", OpCode::CsGroupDemean, BINARY, cs::cs_group_demean),
    cross(
        "winsorize_panel",
        OpCode::CsWinsorizePanel,
        UNARY,
        cs::cs_winsorize_panel,
    ),
];

#[cfg(test)]
mod tests {
    use super::{OperatorRegistry, OP_METAS};
    use crate::ops::{Domain, OpCode};

    #[test]
    fn every_opcode_resolves_to_its_own_entry() {
        for meta in OP_METAS.iter() {
            assert_eq!(OperatorRegistry::get_by_op(meta.op).name, meta.name);
            assert_eq!(
                OperatorRegistry::get(meta.name).map(|m| m.op),
                Some(meta.op)
            );
        }
    }

    #[test]
    fn rolling_ops_declare_two_step_minimum() {
        let meta = OperatorRegistry::get_by_op(OpCode::TsMean);
        assert_eq!(meta.domain, Domain::Ts);
        assert_eq!(meta.min_win, 2);
        assert_eq!(OperatorRegistry::get_by_op(OpCode::TsLinearRegression).outputs, 2);
        assert_eq!(OperatorRegistry::get("one_hot").map(|m| m.outputs), Some(0));
    }
}
