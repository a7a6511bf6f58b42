//! 放射生物学响应指标: EUD, TCP 与两族 NTCP 模型.
//!
//! 所有函数均为纯函数: 输入剂量场, 结构 mask 与模型参数,
//! 返回有界标量. 空结构返回中性值 0 并发出 `warn` 通知,
//! 与 DVH 的空结构策略一致.

use std::collections::HashMap;
use std::f64::consts::SQRT_2;

use log::warn;
use statrs::function::erf::erf;

use crate::consts::TARGET_EUD_A;
use crate::data::{DoseField, StructureKind, StructureMask};
use crate::error::{EvalError, EvalResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod params;

use params::{ModelParams, OrganParams, TargetParams};

/// 广义等效均匀剂量 `EUD = (mean(D^a))^(1/a)`, 以 Gy 为单位.
///
/// `a` 必须非零且有限, 否则返回 `InvalidParameter` (不做静默纠正).
/// 正的小 `a` (约 0.1) 适用于肿瘤组织, 绝对值大的负 `a` 适用于串行器官,
/// 接近 0 的负 `a` 适用于并行器官. `a = 1` 时恰为算术平均剂量.
///
/// 空结构返回 `Ok(0.0)` 并发出通知.
pub fn eud(dose: &DoseField, mask: &StructureMask, a: f64) -> EvalResult<f64> {
    if a == 0.0 || !a.is_finite() {
        return Err(EvalError::InvalidParameter(format!(
            "EUD 指数 a 必须非零且有限: {a}"
        )));
    }

    let values = dose.values_in(mask)?;
    if values.is_empty() {
        warn!("结构 `{}` 不包含任何体素, EUD 取 0", mask.name());
        return Ok(0.0);
    }

    let n = values.len() as f64;
    let mean_pow = values.iter().map(|d| d.powf(a)).sum::<f64>() / n;
    Ok(mean_pow.powf(1.0 / a))
}

/// 肿瘤控制概率 `TCP = 1 / (1 + exp(4 * gamma50 * (1 - EUD / tcd50)))`.
///
/// EUD 以固定指数 [`TARGET_EUD_A`] 计算. `tcd50` 与 `gamma50`
/// 必须为正, 否则返回 `InvalidParameter`. 返回值落在 `[0, 1]`.
pub fn tcp(dose: &DoseField, mask: &StructureMask, tcd50: f64, gamma50: f64) -> EvalResult<f64> {
    if tcd50 <= 0.0 {
        return Err(EvalError::InvalidParameter(format!(
            "tcd50 必须为正: {tcd50}"
        )));
    }
    if gamma50 <= 0.0 {
        return Err(EvalError::InvalidParameter(format!(
            "gamma50 必须为正: {gamma50}"
        )));
    }

    let eud = eud(dose, mask, TARGET_EUD_A)?;
    Ok(1.0 / (1.0 + (4.0 * gamma50 * (1.0 - eud / tcd50)).exp()))
}

/// Lyman-Kutcher-Burman 正常组织并发症概率.
///
/// EUD 以器官惯例指数 `a = -1/n` 计算,
/// `t = (EUD - td50) / (m * td50)`, `NTCP = (1 + erf(t / sqrt(2))) / 2`.
/// `td50`, `m`, `n` 均必须为正, 否则返回 `InvalidParameter`.
/// 返回值落在 `[0, 1]`.
pub fn ntcp_lkb(
    dose: &DoseField,
    mask: &StructureMask,
    td50: f64,
    m: f64,
    n: f64,
) -> EvalResult<f64> {
    if td50 <= 0.0 || m <= 0.0 || n <= 0.0 {
        return Err(EvalError::InvalidParameter(format!(
            "LKB 参数必须全为正: td50 = {td50}, m = {m}, n = {n}"
        )));
    }

    let eud = eud(dose, mask, -1.0 / n)?;
    let t = (eud - td50) / (m * td50);
    Ok(0.5 * (1.0 + erf(t / SQRT_2)))
}

/// Relative Seriality 正常组织并发症概率.
///
/// 按线性二次模型求每个体素的细胞存活
/// `exp(-alpha * D - beta * D^2)`, 在结构内取平均,
/// `NTCP = 1 - 平均存活率`. `alpha`, `beta` 必须非负,
/// 否则返回 `InvalidParameter`. 返回值落在 `[0, 1]`.
///
/// 空结构返回 `Ok(0.0)` 并发出通知.
pub fn ntcp_rs(
    dose: &DoseField,
    mask: &StructureMask,
    alpha: f64,
    beta: f64,
) -> EvalResult<f64> {
    if alpha < 0.0 || beta < 0.0 {
        return Err(EvalError::InvalidParameter(format!(
            "LQ 系数必须非负: alpha = {alpha}, beta = {beta}"
        )));
    }

    let values = dose.values_in(mask)?;
    if values.is_empty() {
        warn!("结构 `{}` 不包含任何体素, NTCP 取 0", mask.name());
        return Ok(0.0);
    }

    let n = values.len() as f64;
    let survival = values
        .iter()
        .map(|d| (-alpha * d - beta * d * d).exp())
        .sum::<f64>()
        / n;
    Ok(1.0 - survival)
}

/// 无并发症肿瘤控制概率 `P+ = TCP * (1 - 加权平均 NTCP)`.
///
/// 权重会被归一化到和为 1. 未提供权重, 或权重个数与 NTCP
/// 个数不一致时退化为等权 (后者同时发出 `warn`).
/// 负权重返回 `InvalidParameter`. 无 NTCP 时直接返回 `tcp`.
pub fn uncomplicated_control(
    tcp: f64,
    ntcp_values: &[f64],
    weights: Option<&[f64]>,
) -> EvalResult<f64> {
    if ntcp_values.is_empty() {
        return Ok(tcp);
    }

    let equal = vec![1.0; ntcp_values.len()];
    let weights = match weights {
        Some(w) if w.len() != ntcp_values.len() => {
            warn!(
                "权重个数 ({}) 与 NTCP 个数 ({}) 不一致, 退化为等权",
                w.len(),
                ntcp_values.len()
            );
            &equal[..]
        }
        Some(w) => w,
        None => &equal[..],
    };
    if weights.iter().any(|w| *w < 0.0) {
        return Err(EvalError::InvalidParameter("权重必须非负".into()));
    }

    let total: f64 = weights.iter().sum();
    let overall = if total > 0.0 {
        ntcp_values
            .iter()
            .zip(weights)
            .map(|(ntcp, w)| ntcp * w / total)
            .sum::<f64>()
    } else {
        ntcp_values.iter().sum::<f64>() / ntcp_values.len() as f64
    };

    Ok(tcp * (1.0 - overall))
}

/// 单个结构的生物学评估结果.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StructureEvaluation {
    /// 结构名.
    pub name: String,

    /// 结构类型标签.
    pub kind: StructureKind,

    /// 广义等效均匀剂量 (Gy).
    pub eud: f64,

    /// 肿瘤控制概率. 仅靶区有值.
    pub tcp: Option<f64>,

    /// LKB 模型 NTCP. 仅提供了 LKB 参数的器官有值.
    pub ntcp_lkb: Option<f64>,

    /// Relative Seriality 模型 NTCP. 仅提供了 LQ 参数的器官有值.
    pub ntcp_rs: Option<f64>,
}

/// 被跳过的结构及原因.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SkippedStructure {
    /// 结构名.
    pub name: String,

    /// 人类可读的跳过原因.
    pub reason: String,
}

/// 整个计划的生物学评估结果. 逐结构评估允许部分失败:
/// 单个结构的空 mask 或非法参数只会使其进入 `skipped`,
/// 不会中止其余结构.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlanEvaluation {
    /// 成功评估的结构.
    pub structures: Vec<StructureEvaluation>,

    /// 被跳过的结构及原因.
    pub skipped: Vec<SkippedStructure>,
}

/// 对一组结构逐个执行生物学评估.
///
/// 参数优先取 `overrides`, 其次取文献默认注册表
/// ([`params::standard_params`]); 两处都没有的结构被跳过.
/// 靶区计算 TCP, 器官按参数块计算 LKB 和 / 或 RS 的 NTCP.
///
/// 个别结构的空 mask 与 `InvalidParameter` 被记录后继续;
/// 形状不一致等其余错误立即向调用方传播.
pub fn evaluate_plan(
    dose: &DoseField,
    masks: &[StructureMask],
    overrides: &HashMap<String, ModelParams>,
) -> EvalResult<PlanEvaluation> {
    let mut result = PlanEvaluation::default();

    for mask in masks {
        let name = mask.name();
        let Some(params) = overrides
            .get(name)
            .or_else(|| params::standard_params(name))
        else {
            warn!("结构 `{name}` 无可用模型参数, 跳过");
            result.skipped.push(SkippedStructure {
                name: name.to_owned(),
                reason: "无可用模型参数".into(),
            });
            continue;
        };

        if mask.is_empty() {
            warn!("结构 `{name}` 不包含任何体素, 跳过");
            result.skipped.push(SkippedStructure {
                name: name.to_owned(),
                reason: "结构不包含任何体素".into(),
            });
            continue;
        }

        match evaluate_structure(dose, mask, params) {
            Ok(ev) => result.structures.push(ev),
            Err(EvalError::InvalidParameter(reason)) => {
                warn!("结构 `{name}` 参数非法, 跳过: {reason}");
                result.skipped.push(SkippedStructure {
                    name: name.to_owned(),
                    reason,
                });
            }
            Err(other) => return Err(other),
        }
    }

    Ok(result)
}

/// 单结构评估. 参数类型与结构标签不匹配按非法参数处理.
fn evaluate_structure(
    dose: &DoseField,
    mask: &StructureMask,
    params: &ModelParams,
) -> EvalResult<StructureEvaluation> {
    match (mask.kind(), params) {
        (StructureKind::Target, ModelParams::Target(p)) => evaluate_target(dose, mask, p),
        (StructureKind::Organ, ModelParams::Organ(p)) => evaluate_organ(dose, mask, p),
        (kind, _) => Err(EvalError::InvalidParameter(format!(
            "参数类型与结构标签 {kind:?} 不匹配"
        ))),
    }
}

fn evaluate_target(
    dose: &DoseField,
    mask: &StructureMask,
    p: &TargetParams,
) -> EvalResult<StructureEvaluation> {
    Ok(StructureEvaluation {
        name: mask.name().to_owned(),
        kind: StructureKind::Target,
        eud: eud(dose, mask, p.a)?,
        tcp: Some(tcp(dose, mask, p.tcd50, p.gamma50)?),
        ntcp_lkb: None,
        ntcp_rs: None,
    })
}

fn evaluate_organ(
    dose: &DoseField,
    mask: &StructureMask,
    p: &OrganParams,
) -> EvalResult<StructureEvaluation> {
    if p.lkb.is_none() && p.seriality.is_none() {
        return Err(EvalError::InvalidParameter(
            "器官缺少 NTCP 模型参数".into(),
        ));
    }

    let ntcp_lkb = match &p.lkb {
        Some(lkb) => Some(ntcp_lkb(dose, mask, lkb.td50, lkb.m, lkb.n)?),
        None => None,
    };
    let ntcp_rs = match &p.seriality {
        Some(rs) => Some(ntcp_rs(dose, mask, rs.alpha, rs.beta)?),
        None => None,
    };

    Ok(StructureEvaluation {
        name: mask.name().to_owned(),
        kind: StructureKind::Organ,
        eud: eud(dose, mask, p.a)?,
        tcp: None,
        ntcp_lkb,
        ntcp_rs,
    })
}
