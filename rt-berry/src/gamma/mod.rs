//! Gamma 指数分析: 参考剂量场与评估 (如实测) 剂量场的空间一致性度量.
//!
//! 对每个纳入体素, 在有界邻域内搜索使
//! `sqrt((空间距离 / 距离判据)^2 + (剂量差 / 剂量判据)^2)`
//! 最小的候选点. 邻域以每轴整数体素偏移表示, 由
//! `search_radius_factor * distance_mm` 换算而来; 半径之外的候选点
//! 永远不会被检查, 这是从临床算法继承的有意截断, 不是待修复缺陷.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use ndarray::{Array3, ArrayView3, ArrayViewMut2, Axis};

use crate::consts::{
    DEFAULT_DISTANCE_CRITERIA_MM, DEFAULT_DOSE_CRITERIA_PCT, DEFAULT_SEARCH_RADIUS_FACTOR,
    DEFAULT_THRESHOLD_PCT,
};
use crate::data::DoseField;
use crate::error::{EvalError, EvalResult};
use crate::Idx3d;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
    }
}

/// 剂量归一化策略.
///
/// 两种模式下纳入 mask 都基于按参考场全局最大值归一化的参考剂量;
/// 模式只改变剂量差项的分母, 不改变纳入语义.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Normalization {
    /// 全局归一化: 两个场都以参考场最大值为分母换算成百分比.
    Global,

    /// 局部归一化: 剂量差以候选评估体素自身的剂量为分母.
    Local,
}

/// Gamma 分析判据.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GammaCriteria {
    /// 剂量判据 (%).
    pub dose_pct: f64,

    /// 距离判据 DTA (mm).
    pub distance_mm: f64,

    /// 纳入阈值 (%): 归一化参考剂量低于该值的体素不参与统计.
    pub threshold_pct: f64,

    /// 归一化策略.
    pub normalization: Normalization,

    /// 搜索半径相对距离判据的倍数. 加大会提高精度并显著增加开销;
    /// 默认值 3 继承自临床算法, 合适的取值属于标定问题.
    pub search_radius_factor: f64,
}

impl Default for GammaCriteria {
    /// 3% / 3mm, 10% 阈值, 全局归一化.
    fn default() -> Self {
        Self {
            dose_pct: DEFAULT_DOSE_CRITERIA_PCT,
            distance_mm: DEFAULT_DISTANCE_CRITERIA_MM,
            threshold_pct: DEFAULT_THRESHOLD_PCT,
            normalization: Normalization::Global,
            search_radius_factor: DEFAULT_SEARCH_RADIUS_FACTOR,
        }
    }
}

impl GammaCriteria {
    /// 检查判据合法性.
    fn validate(&self) -> EvalResult<()> {
        if self.dose_pct <= 0.0 || !self.dose_pct.is_finite() {
            return Err(EvalError::InvalidParameter(format!(
                "剂量判据必须为正: {}",
                self.dose_pct
            )));
        }
        if self.distance_mm <= 0.0 || !self.distance_mm.is_finite() {
            return Err(EvalError::InvalidParameter(format!(
                "距离判据必须为正: {}",
                self.distance_mm
            )));
        }
        if self.threshold_pct < 0.0 || !self.threshold_pct.is_finite() {
            return Err(EvalError::InvalidParameter(format!(
                "纳入阈值必须非负: {}",
                self.threshold_pct
            )));
        }
        if self.search_radius_factor <= 0.0 || !self.search_radius_factor.is_finite() {
            return Err(EvalError::InvalidParameter(format!(
                "搜索半径倍数必须为正: {}",
                self.search_radius_factor
            )));
        }
        Ok(())
    }
}

/// Gamma 分析结果. 一次比较创建一份, 之后不再修改.
#[derive(Clone, Debug)]
pub struct GammaResult {
    map: Array3<f64>,
    pass_rate: f64,
    mean_gamma: f64,
    max_gamma: f64,
    included: usize,
    criteria: GammaCriteria,
    resampled: bool,
}

impl GammaResult {
    /// 获取按参考网格对齐的逐体素 gamma 值.
    ///
    /// 被阈值排除的体素取正无穷.
    #[inline]
    pub fn map(&self) -> ArrayView3<'_, f64> {
        self.map.view()
    }

    /// 纳入体素中 gamma <= 1 的百分比.
    #[inline]
    pub fn pass_rate(&self) -> f64 {
        self.pass_rate
    }

    /// 纳入体素的 gamma 平均值.
    #[inline]
    pub fn mean_gamma(&self) -> f64 {
        self.mean_gamma
    }

    /// 纳入体素的 gamma 最大值.
    #[inline]
    pub fn max_gamma(&self) -> f64 {
        self.max_gamma
    }

    /// 参与统计的体素个数.
    #[inline]
    pub fn included(&self) -> usize {
        self.included
    }

    /// 产生该结果的判据.
    #[inline]
    pub fn criteria(&self) -> &GammaCriteria {
        &self.criteria
    }

    /// 评估场是否因网格不一致被重采样到参考网格?
    #[inline]
    pub fn resampled(&self) -> bool {
        self.resampled
    }

    /// 按通过率下限与最大 gamma 上限给出 QA 判定.
    ///
    /// 任一阈值不满足时, `reasons` 给出对应的人类可读说明.
    pub fn evaluate_pass_fail(
        &self,
        pass_rate_threshold: f64,
        max_gamma_threshold: f64,
    ) -> QaVerdict {
        let pass_rate_ok = self.pass_rate >= pass_rate_threshold;
        let max_gamma_ok = self.max_gamma <= max_gamma_threshold;

        let mut reasons = vec![];
        if !pass_rate_ok {
            reasons.push(format!(
                "Gamma 通过率 ({:.1}%) 低于要求阈值 ({:.1}%)",
                self.pass_rate, pass_rate_threshold
            ));
        }
        if !max_gamma_ok {
            reasons.push(format!(
                "最大 Gamma 值 ({:.2}) 超过允许上限 ({:.2})",
                self.max_gamma, max_gamma_threshold
            ));
        }

        QaVerdict {
            passed: pass_rate_ok && max_gamma_ok,
            pass_rate_ok,
            max_gamma_ok,
            reasons,
        }
    }
}

/// QA 通过 / 不通过判定.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QaVerdict {
    /// 两项检查是否全部通过.
    pub passed: bool,

    /// 通过率检查结果.
    pub pass_rate_ok: bool,

    /// 最大 gamma 检查结果.
    pub max_gamma_ok: bool,

    /// 未通过原因列表. 全部通过时为空.
    pub reasons: Vec<String>,
}

/// 比较参考剂量场与评估剂量场, 产生逐体素 gamma 图与汇总统计.
///
/// 两个场网格不一致时, 评估场先被三线性重采样到参考网格
/// (记入日志与 [`GammaResult::resampled`], 不视为错误).
/// 参考场最大值不为正时返回 `NormalizationError`.
#[inline]
pub fn compare(
    reference: &DoseField,
    evaluated: &DoseField,
    criteria: &GammaCriteria,
) -> EvalResult<GammaResult> {
    compare_cancellable(reference, evaluated, criteria, &AtomicBool::new(false))
}

/// 与 [`compare`] 相同, 但支持协作式取消.
///
/// 取消标志在体素批次 (z 切片) 之间检查, 而非逐体素;
/// 被取消的计算返回 `Err(Cancelled)`, 绝不暴露部分结果.
pub fn compare_cancellable(
    reference: &DoseField,
    evaluated: &DoseField,
    criteria: &GammaCriteria,
    cancel: &AtomicBool,
) -> EvalResult<GammaResult> {
    criteria.validate()?;

    let resampled_field;
    let (evaluated, resampled) = if evaluated.grid() == reference.grid() {
        (evaluated, false)
    } else {
        info!(
            "评估剂量场网格 {:?} 与参考网格 {:?} 不一致, 已重采样",
            evaluated.shape(),
            reference.shape()
        );
        resampled_field = evaluated.resample_to(reference.grid());
        (&resampled_field, true)
    };

    let ref_max = reference.max_dose();
    if ref_max <= 0.0 {
        return Err(EvalError::NormalizationError);
    }

    // 纳入 mask 始终基于按参考最大值归一化的参考场.
    let ref_pct = reference.data().mapv(|d| d / ref_max * 100.0);
    let inclusion = ref_pct.mapv(|d| d >= criteria.threshold_pct);

    // Global 模式下两个场都换算成参考最大值的百分比;
    // Local 模式保留 Gy 原值, 剂量差项逐候选体素归一.
    let local = criteria.normalization == Normalization::Local;
    let (ref_term, eval_term) = if local {
        (reference.data().to_owned(), evaluated.data().to_owned())
    } else {
        (ref_pct.clone(), evaluated.data().mapv(|d| d / ref_max * 100.0))
    };

    let spacing = reference.grid().spacing();
    let radius_mm = criteria.search_radius_factor * criteria.distance_mm;
    // 每轴整数体素偏移上限, 与原临床算法一致的截断换算.
    let reach = [
        (radius_mm / spacing[0]) as usize + 1,
        (radius_mm / spacing[1]) as usize + 1,
        (radius_mm / spacing[2]) as usize + 1,
    ];

    let kernel = GammaKernel {
        ref_term: ref_term.view(),
        eval_term: eval_term.view(),
        inclusion: inclusion.view(),
        spacing,
        reach,
        dose_pct: criteria.dose_pct,
        distance_mm: criteria.distance_mm,
        local,
    };

    let mut map = Array3::from_elem(reference.shape(), f64::INFINITY);

    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            let outcome = map
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .try_for_each(|(z, slice)| {
                    if cancel.load(Ordering::Acquire) {
                        return Err(());
                    }
                    kernel.fill_slice(z, slice);
                    Ok(())
                });
            if outcome.is_err() {
                return Err(EvalError::Cancelled);
            }
        } else {
            for (z, slice) in map.axis_iter_mut(Axis(0)).enumerate() {
                if cancel.load(Ordering::Acquire) {
                    return Err(EvalError::Cancelled);
                }
                kernel.fill_slice(z, slice);
            }
        }
    }

    // 汇总只统计纳入体素.
    let mut included = 0usize;
    let mut passed = 0usize;
    let mut sum = 0.0;
    let mut max = 0.0f64;
    for (g, inc) in map.iter().zip(inclusion.iter()) {
        if !inc {
            continue;
        }
        included += 1;
        if *g <= 1.0 {
            passed += 1;
        }
        sum += g;
        max = max.max(*g);
    }

    let (pass_rate, mean_gamma) = if included > 0 {
        (
            passed as f64 / included as f64 * 100.0,
            sum / included as f64,
        )
    } else {
        warn!("没有体素超过纳入阈值 {}%", criteria.threshold_pct);
        (0.0, 0.0)
    };

    Ok(GammaResult {
        map,
        pass_rate,
        mean_gamma,
        max_gamma: max,
        included,
        criteria: criteria.clone(),
        resampled,
    })
}

/// 单次比较的只读搜索上下文.
struct GammaKernel<'a> {
    ref_term: ArrayView3<'a, f64>,
    eval_term: ArrayView3<'a, f64>,
    inclusion: ArrayView3<'a, bool>,
    spacing: [f64; 3],
    reach: [usize; 3],
    dose_pct: f64,
    distance_mm: f64,
    local: bool,
}

impl GammaKernel<'_> {
    /// 填充第 `z` 层输出切片. 各层互不相交, 可以并行执行.
    fn fill_slice(&self, z: usize, mut slice: ArrayViewMut2<'_, f64>) {
        let (_, nh, nw) = self.ref_term.dim();
        for h in 0..nh {
            for w in 0..nw {
                if self.inclusion[(z, h, w)] {
                    slice[(h, w)] = self.gamma_at((z, h, w));
                }
            }
        }
    }

    /// 在 `(z, h, w)` 处的有界邻域上求最小 gamma 候选值.
    fn gamma_at(&self, (z, h, w): Idx3d) -> f64 {
        let (nz, nh, nw) = self.ref_term.dim();
        let ref_v = self.ref_term[(z, h, w)];

        let z_lo = z.saturating_sub(self.reach[0]);
        let z_hi = (z + self.reach[0]).min(nz - 1);
        let h_lo = h.saturating_sub(self.reach[1]);
        let h_hi = (h + self.reach[1]).min(nh - 1);
        let w_lo = w.saturating_sub(self.reach[2]);
        let w_hi = (w + self.reach[2]).min(nw - 1);

        let dta2 = self.distance_mm * self.distance_mm;
        let mut min_gamma2 = f64::INFINITY;

        for zz in z_lo..=z_hi {
            let dz = (zz as f64 - z as f64) * self.spacing[0];
            for hh in h_lo..=h_hi {
                let dh = (hh as f64 - h as f64) * self.spacing[1];
                for ww in w_lo..=w_hi {
                    let dw = (ww as f64 - w as f64) * self.spacing[2];
                    let eval_v = self.eval_term[(zz, hh, ww)];

                    let dose_diff = if self.local {
                        // 以候选评估体素自身剂量为分母; 零剂量候选无定义.
                        if eval_v <= 0.0 {
                            continue;
                        }
                        (ref_v - eval_v).abs() * 100.0 / (eval_v * self.dose_pct)
                    } else {
                        (ref_v - eval_v).abs() / self.dose_pct
                    };

                    let r2 = dz * dz + dh * dh + dw * dw;
                    let gamma2 = r2 / dta2 + dose_diff * dose_diff;
                    if gamma2 < min_gamma2 {
                        min_gamma2 = gamma2;
                    }
                }
            }
        }

        min_gamma2.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{DEFAULT_MAX_GAMMA_THRESHOLD, DEFAULT_PASS_RATE_THRESHOLD};
    use crate::data::VoxelGrid;
    use ndarray::Array3;

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    /// 10x10x10, 2mm 各向同性, 剂量沿 z 轴从 0 线性升到 100 Gy.
    fn linear_field() -> DoseField {
        let grid = VoxelGrid::new((10, 10, 10), [2.0; 3]).unwrap();
        let data = Array3::from_shape_fn((10, 10, 10), |(z, _, _)| z as f64 * 100.0 / 9.0);
        DoseField::new(grid, data).unwrap()
    }

    fn uniform_field(gy: f64) -> DoseField {
        let grid = VoxelGrid::new((4, 4, 4), [2.0; 3]).unwrap();
        DoseField::new(grid, Array3::from_elem((4, 4, 4), gy)).unwrap()
    }

    /// 自比较: 任意归一化模式下通过率 100%, 最大 gamma 为 0.
    #[test]
    fn test_self_comparison() {
        let field = linear_field();
        for normalization in [Normalization::Global, Normalization::Local] {
            let criteria = GammaCriteria {
                normalization,
                ..Default::default()
            };
            let result = compare(&field, &field, &criteria).unwrap();
            assert!(result.included() > 0);
            assert!(f64_eq(result.pass_rate(), 100.0), "{normalization:?}");
            assert!(f64_eq(result.max_gamma(), 0.0));
            assert!(f64_eq(result.mean_gamma(), 0.0));
            assert!(!result.resampled());
        }
    }

    /// 阈值排除: 低于纳入阈值的体素不进入统计分母, 图上取正无穷.
    #[test]
    fn test_threshold_exclusion() {
        // 前两层 100 Gy, 后两层 5 Gy (归一化后 5%, 低于 10% 阈值).
        let grid = VoxelGrid::new((4, 4, 4), [2.0; 3]).unwrap();
        let data = Array3::from_shape_fn((4, 4, 4), |(z, _, _)| if z < 2 { 100.0 } else { 5.0 });
        let field = DoseField::new(grid, data).unwrap();

        let result = compare(&field, &field, &GammaCriteria::default()).unwrap();
        assert_eq!(result.included(), 32);
        assert!(f64_eq(result.pass_rate(), 100.0));
        assert!(result.map()[(3, 0, 0)].is_infinite());
        assert!(f64_eq(result.map()[(0, 0, 0)], 0.0));
    }

    /// 均匀场整体偏移: 全局模式下 gamma 有解析值.
    #[test]
    fn test_uniform_offset_global() {
        let reference = uniform_field(100.0);
        let evaluated = uniform_field(104.0);

        let result = compare(&reference, &evaluated, &GammaCriteria::default()).unwrap();
        // 偏差 4%, 判据 3%: 每个体素 gamma = 4/3, 无空间补偿.
        assert!(f64_eq(result.pass_rate(), 0.0));
        assert!((result.max_gamma() - 4.0 / 3.0).abs() < 1e-9);
        assert!((result.mean_gamma() - 4.0 / 3.0).abs() < 1e-9);

        let verdict =
            result.evaluate_pass_fail(DEFAULT_PASS_RATE_THRESHOLD, DEFAULT_MAX_GAMMA_THRESHOLD);
        assert!(!verdict.passed);
        assert!(!verdict.pass_rate_ok);
        assert!(verdict.max_gamma_ok);
        assert_eq!(verdict.reasons.len(), 1);
    }

    /// 局部模式只改变剂量差项分母, 不改变纳入语义.
    #[test]
    fn test_local_normalization() {
        let reference = uniform_field(100.0);
        let evaluated = uniform_field(104.0);

        let criteria = GammaCriteria {
            normalization: Normalization::Local,
            ..Default::default()
        };
        let result = compare(&reference, &evaluated, &criteria).unwrap();
        assert_eq!(result.included(), 64);
        // 局部分母 104: |100 - 104| / 104 * 100 / 3.
        let expected = 4.0 / 104.0 * 100.0 / 3.0;
        assert!((result.max_gamma() - expected).abs() < 1e-9);
    }

    /// 网格不一致时评估场被重采样, 事件可在结果上断言.
    #[test]
    fn test_grid_mismatch_resampled() {
        let reference = linear_field();
        // 线性场重采样到更细网格再比较: 插值精确还原, 仍应全部通过.
        let fine = VoxelGrid::new((19, 19, 19), [1.0; 3]).unwrap();
        let evaluated = reference.resample_to(&fine);

        let result = compare(&reference, &evaluated, &GammaCriteria::default()).unwrap();
        assert!(result.resampled());
        assert!(f64_eq(result.pass_rate(), 100.0));
        assert!(f64_eq(result.max_gamma(), 0.0));
    }

    /// 参考场最大值为 0 时拒绝归一化.
    #[test]
    fn test_normalization_error() {
        let zero = uniform_field(0.0);
        assert_eq!(
            compare(&zero, &zero, &GammaCriteria::default()).unwrap_err(),
            EvalError::NormalizationError
        );
    }

    /// 非法判据在计算开始前被拒绝.
    #[test]
    fn test_invalid_criteria() {
        let field = uniform_field(1.0);
        for criteria in [
            GammaCriteria {
                dose_pct: 0.0,
                ..Default::default()
            },
            GammaCriteria {
                distance_mm: -3.0,
                ..Default::default()
            },
            GammaCriteria {
                threshold_pct: -1.0,
                ..Default::default()
            },
            GammaCriteria {
                search_radius_factor: 0.0,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                compare(&field, &field, &criteria).unwrap_err(),
                EvalError::InvalidParameter(_)
            ));
        }
    }

    /// 已置位的取消标志使计算返回 `Cancelled`, 不产生部分结果.
    #[test]
    fn test_cancellation() {
        let field = linear_field();
        let cancel = AtomicBool::new(true);
        assert_eq!(
            compare_cancellable(&field, &field, &GammaCriteria::default(), &cancel).unwrap_err(),
            EvalError::Cancelled
        );
    }

    /// 搜索半径倍数可调: 半径足够大时, 空间补偿能挽救剂量偏差.
    #[test]
    fn test_search_radius_factor() {
        // 线性梯度场沿 z 平移一个体素 (2mm): DTA 搜索应找到完美匹配.
        let grid = VoxelGrid::new((10, 4, 4), [2.0; 3]).unwrap();
        let reference = DoseField::new(
            grid.clone(),
            Array3::from_shape_fn((10, 4, 4), |(z, _, _)| 20.0 + z as f64 * 5.0),
        )
        .unwrap();
        let evaluated = DoseField::new(
            grid,
            Array3::from_shape_fn((10, 4, 4), |(z, _, _)| 20.0 + (z + 1) as f64 * 5.0),
        )
        .unwrap();

        let result = compare(&reference, &evaluated, &GammaCriteria::default()).unwrap();
        // z >= 1 的体素在 2mm 平移处找到完美匹配 (3mm DTA 内): gamma = 2/3.
        // z = 0 层 (16 体素) 无匹配候选, 最优即原位剂量差:
        // (5 / 65 * 100) / 3 = 100 / 39, 不通过.
        assert_eq!(result.included(), 160);
        assert!(f64_eq(result.pass_rate(), 90.0));
        assert!(f64_eq(result.max_gamma(), 100.0 / 39.0));
        assert!(result.map()[(5, 2, 2)] <= 2.0 / 3.0 + 1e-9);
    }
}
