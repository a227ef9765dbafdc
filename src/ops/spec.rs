use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Cell by cell; any layout.
    Elem,
    /// Along time inside each instrument, reads a rolling window.
    Ts,
    /// Across instruments inside each date.
    Cs,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    ElemAdd,
    ElemSub,
    ElemMul,
    ElemDiv,
    ElemMod,
    ElemPow,
    ElemNeg,
    ElemAbs,
    ElemLog,
    ElemSign,
    ElemLt,
    ElemLe,
    ElemGt,
    ElemGe,
    ElemEq,
    ElemNe,
    ElemAnd,
    ElemOr,
    ElemNot,
    ElemFillNa,
    ElemMaskedFill,
    ElemClamp,
    ElemFilter,
    ElemShift,
    ElemPad,
    ElemAdjusted,
    ElemSelect,
    ElemToFloat,
    ElemOneHot,
    TsSum,
    TsProduct,
    TsMean,
    TsStd,
    TsVar,
    TsMax,
    TsMin,
    TsCount,
    TsRank,
    TsReturns,
    TsAny,
    TsAll,
    TsCorr,
    TsCov,
    TsLinearRegression,
    CsRank,
    CsZscore,
    CsDemean,
    CsQuantile,
    CsToWeight,
    CsWinsorize,
    CsMadClamp,
    CsGroupDemean,
    CsWinsorizePanel,
}

impl OpCode {
    pub const COUNT: usize = Self::CsWinsorizePanel as usize + 1;

    #[inline]
    pub const fn as_usize(self) -> usize {
        self as usize
    }
}

/// Construction-time parameters a kernel reads; validated by the builders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpParam {
    None,
    /// Positive shifts move values later in time.
    Periods(isize),
    Bins(usize),
    /// Winsorize tail fraction or MAD multiple.
    Z(f64),
    Ascending(bool),
    Fill(f64),
    Clamp { lo: f64, hi: f64 },
    Select(usize),
    Demean(bool),
}

impl OpParam {
    #[inline]
    pub const fn periods(self) -> Option<isize> {
        match self {
            Self::Periods(periods) => Some(periods),
            _ => None,
        }
    }

    #[inline]
    pub const fn bins(self) -> Option<usize> {
        match self {
            Self::Bins(bins) => Some(bins),
            _ => None,
        }
    }

    #[inline]
    pub const fn z(self) -> Option<f64> {
        match self {
            Self::Z(z) => Some(z),
            _ => None,
        }
    }

    /// Defaults to ascending when the op carries no direction.
    #[inline]
    pub const fn ascending(self) -> bool {
        match self {
            Self::Ascending(ascending) => ascending,
            _ => true,
        }
    }

    #[inline]
    pub const fn fill(self) -> Option<f64> {
        match self {
            Self::Fill(fill) => Some(fill),
            _ => None,
        }
    }

    #[inline]
    pub const fn clamp(self) -> Option<(f64, f64)> {
        match self {
            Self::Clamp { lo, hi } => Some((lo, hi)),
            _ => None,
        }
    }

    #[inline]
    pub const fn select(self) -> Option<usize> {
        match self {
            Self::Select(index) => Some(index),
            _ => None,
        }
    }

    #[inline]
    pub const fn demean(self) -> bool {
        match self {
            Self::Demean(demean) => demean,
            _ => true,
        }
    }
}
