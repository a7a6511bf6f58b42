//! 放射生物学模型参数与文献默认值注册表.
//!
//! 注册表以结构名为键, 提供常见器官与通用 PTV 的文献默认参数.
//! 调用方可以在评估时传入覆盖表, 覆盖表优先于注册表.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::data::StructureKind;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 靶区模型参数.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TargetParams {
    /// EUD 指数. 靶区取小的正值 (典型 0.1).
    pub a: f64,

    /// 达到 50% TCP 所需剂量 (Gy).
    pub tcd50: f64,

    /// 剂量响应曲线在 50% 处的斜率.
    pub gamma50: f64,
}

/// Lyman-Kutcher-Burman 模型参数.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LkbParams {
    /// 产生 50% 并发症的耐受剂量 (Gy).
    pub td50: f64,

    /// 剂量响应曲线斜率.
    pub m: f64,

    /// 体积效应指数.
    pub n: f64,
}

/// Relative Seriality 模型 (线性二次细胞存活) 参数.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SerialityParams {
    /// 线性项系数 (Gy^-1).
    pub alpha: f64,

    /// 二次项系数 (Gy^-2).
    pub beta: f64,
}

/// 危及器官模型参数.
///
/// 两个 NTCP 模型的参数块均为可选; 评估时存在哪个就运行哪个,
/// 两者俱在时两个结果都保留.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OrganParams {
    /// EUD 指数. 串行器官取绝对值大的负数, 并行器官取接近 0 的负数.
    pub a: f64,

    /// LKB 模型参数.
    pub lkb: Option<LkbParams>,

    /// Relative Seriality 模型参数.
    pub seriality: Option<SerialityParams>,
}

/// 某结构可用的模型参数集合.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ModelParams {
    /// 靶区参数, 用于 TCP.
    Target(TargetParams),

    /// 危及器官参数, 用于 NTCP.
    Organ(OrganParams),
}

impl ModelParams {
    /// 参数对应的结构类型.
    #[inline]
    pub fn kind(&self) -> StructureKind {
        match self {
            Self::Target(_) => StructureKind::Target,
            Self::Organ(_) => StructureKind::Organ,
        }
    }
}

/// 以 LKB 参数构建器官项的快捷方式.
#[inline]
const fn organ_lkb(a: f64, td50: f64, m: f64, n: f64) -> ModelParams {
    ModelParams::Organ(OrganParams {
        a,
        lkb: Some(LkbParams { td50, m, n }),
        seriality: None,
    })
}

/// 文献默认参数表. 数值来源与临床惯例一致, 仅覆盖常见结构;
/// 未收录的结构需要调用方显式提供参数.
static STANDARD_PARAMS: Lazy<HashMap<&'static str, ModelParams>> = Lazy::new(|| {
    HashMap::from([
        (
            "PTV",
            ModelParams::Target(TargetParams {
                a: 0.1,
                tcd50: 60.0,
                gamma50: 2.0,
            }),
        ),
        ("Brain", organ_lkb(-8.0, 60.0, 0.15, 0.25)),
        // 串行器官.
        ("Spinal Cord", organ_lkb(-20.0, 50.0, 0.175, 0.05)),
        // 并行器官.
        ("Lung", organ_lkb(-1.2, 30.8, 0.37, 0.99)),
        ("Heart", organ_lkb(-3.1, 48.0, 0.1, 0.35)),
        ("Esophagus", organ_lkb(-19.0, 68.0, 0.11, 0.06)),
        ("Parotid", organ_lkb(-2.2, 39.9, 0.4, 1.0)),
        ("Kidney", organ_lkb(-3.0, 28.0, 0.5, 0.7)),
        ("Liver", organ_lkb(-2.0, 40.0, 0.28, 0.7)),
        ("Bladder", organ_lkb(-3.63, 80.0, 0.11, 0.5)),
        ("Rectum", organ_lkb(-8.33, 80.0, 0.14, 0.12)),
    ])
});

/// 按结构名查找文献默认参数. 未收录的结构返回 `None`.
#[inline]
pub fn standard_params(name: &str) -> Option<&'static ModelParams> {
    STANDARD_PARAMS.get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 注册表必须覆盖原始默认表的全部结构.
    #[test]
    fn test_registry_coverage() {
        for name in [
            "PTV",
            "Brain",
            "Spinal Cord",
            "Lung",
            "Heart",
            "Esophagus",
            "Parotid",
            "Kidney",
            "Liver",
            "Bladder",
            "Rectum",
        ] {
            assert!(standard_params(name).is_some(), "缺少 {name}");
        }
        assert!(standard_params("Not An Organ").is_none());
    }

    /// 抽查具体数值与类型标签.
    #[test]
    fn test_registry_values() {
        let ModelParams::Target(ptv) = standard_params("PTV").unwrap() else {
            panic!("PTV 必须是靶区参数");
        };
        assert_eq!(ptv.tcd50, 60.0);
        assert_eq!(ptv.gamma50, 2.0);

        let cord = standard_params("Spinal Cord").unwrap();
        assert_eq!(cord.kind(), StructureKind::Organ);
        let ModelParams::Organ(p) = cord else {
            unreachable!()
        };
        assert_eq!(p.a, -20.0);
        let lkb = p.lkb.unwrap();
        assert_eq!((lkb.td50, lkb.m, lkb.n), (50.0, 0.175, 0.05));
        assert!(p.seriality.is_none());
    }
}
