//! 剂量体积直方图 (DVH) 计算.
//!
//! 累积曲线以被 mask 覆盖的体素剂量为基础逐体素构建,
//! 微分形式将剂量分入固定数量的区间. 派生指标 (Dx, Vx)
//! 在曲线上做线性插值, 超出定义域时钳制到端点值, 绝不外推.

use itertools::Itertools;
use log::warn;
use ordered_float::OrderedFloat;

use crate::consts::{DEFAULT_DVH_BINS, DVH_DOSE_HEADROOM};
use crate::data::{DoseField, StructureMask};
use crate::error::{EvalError, EvalResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 累积 / 微分 DVH 曲线及其派生指标.
///
/// 曲线一经返回即不可变. 累积部分按剂量升序存储,
/// 体积百分比单调非增; 首尾各有一个哨兵点 `(0, 100)` 与 `(d_max, 0)`,
/// 保证 0 Gy 处体积为 100%, 超过最大剂量处体积为 0%.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DvhCurve {
    name: String,
    dose: Vec<f64>,
    volume: Vec<f64>,
    diff_dose: Vec<f64>,
    diff_volume: Vec<f64>,
    voxel_count: usize,
    volume_cc: f64,
    d_min: f64,
    d_max: f64,
    d_mean: f64,
}

impl DvhCurve {
    /// 计算结构的 DVH 曲线. 微分直方图使用默认 bin 数.
    ///
    /// 剂量场与 mask 形状不一致时返回 `ShapeMismatch`.
    /// 空结构返回零体积曲线并发出一条 `warn` 通知
    /// (轮廓编辑后出现空 mask 是合法场景), 不视为错误.
    #[inline]
    pub fn compute(dose: &DoseField, mask: &StructureMask) -> EvalResult<Self> {
        Self::compute_with_bins(dose, mask, DEFAULT_DVH_BINS)
    }

    /// 与 [`Self::compute`] 相同, 但显式指定微分直方图 bin 数.
    ///
    /// `bins` 为 0 时返回 `InvalidParameter`.
    pub fn compute_with_bins(
        dose: &DoseField,
        mask: &StructureMask,
        bins: usize,
    ) -> EvalResult<Self> {
        if bins == 0 {
            return Err(EvalError::InvalidParameter(
                "微分直方图 bin 数必须非零".into(),
            ));
        }

        let mut values = dose.values_in(mask)?;
        let volume_cc = mask.volume_cc(dose.grid())?;

        if values.is_empty() {
            warn!("结构 `{}` 不包含任何体素, 返回零体积 DVH", mask.name());
            return Ok(Self {
                name: mask.name().to_owned(),
                dose: vec![],
                volume: vec![],
                diff_dose: vec![],
                diff_volume: vec![],
                voxel_count: 0,
                volume_cc: 0.0,
                d_min: 0.0,
                d_max: 0.0,
                d_mean: 0.0,
            });
        }

        values.sort_unstable_by_key(|v| OrderedFloat(*v));
        let n = values.len();
        let nf = n as f64;

        let d_min = values[0];
        let d_max = values[n - 1];
        let d_mean = values.iter().sum::<f64>() / nf;

        // 累积曲线: 点 k 的体积取 "剂量不低于该体素值的体积占比"
        // 的绘图位置形式 100 * (n - k - 0.5) / n, 加上两端哨兵.
        let mut dose_pts = Vec::with_capacity(n + 2);
        let mut volume_pts = Vec::with_capacity(n + 2);
        dose_pts.push(0.0);
        volume_pts.push(100.0);
        for (k, v) in values.iter().enumerate() {
            dose_pts.push(*v);
            volume_pts.push(100.0 * (nf - k as f64 - 0.5) / nf);
        }
        dose_pts.push(d_max);
        volume_pts.push(0.0);

        // 微分直方图: [0, d_max * 1.1] 上的等宽区间.
        // 全零剂量时上限退化为 0, 以 1.0 兜底保证 bin 宽非零.
        let hi = match d_max * DVH_DOSE_HEADROOM {
            v if v > 0.0 => v,
            _ => 1.0,
        };
        let width = hi / bins as f64;
        let mut counts = vec![0usize; bins];
        for v in &values {
            let idx = ((v / width) as usize).min(bins - 1);
            counts[idx] += 1;
        }
        let diff_dose = (0..bins).map(|i| (i as f64 + 0.5) * width).collect();
        let diff_volume = counts.iter().map(|c| *c as f64 / nf * 100.0).collect();

        Ok(Self {
            name: mask.name().to_owned(),
            dose: dose_pts,
            volume: volume_pts,
            diff_dose,
            diff_volume,
            voxel_count: n,
            volume_cc,
            d_min,
            d_max,
            d_mean,
        })
    }

    /// 获取结构名.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 曲线是否来自空结构?
    ///
    /// 调用方在将曲线当作有效数据使用前必须检查该标志.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.voxel_count == 0
    }

    /// 获取参与统计的体素个数.
    #[inline]
    pub fn voxel_count(&self) -> usize {
        self.voxel_count
    }

    /// 获取结构体积, 以立方厘米为单位.
    #[inline]
    pub fn volume_cc(&self) -> f64 {
        self.volume_cc
    }

    /// 按剂量升序迭代累积曲线的 `(剂量 Gy, 体积 %)` 点对.
    #[inline]
    pub fn cumulative(&self) -> impl ExactSizeIterator<Item = (f64, f64)> + '_ {
        self.dose.iter().copied().zip(self.volume.iter().copied())
    }

    /// 按剂量升序迭代微分曲线的 `(bin 中心剂量 Gy, 体积 %)` 点对.
    #[inline]
    pub fn differential(&self) -> impl ExactSizeIterator<Item = (f64, f64)> + '_ {
        self.diff_dose
            .iter()
            .copied()
            .zip(self.diff_volume.iter().copied())
    }

    /// 最小剂量 (Gy).
    #[inline]
    pub fn d_min(&self) -> f64 {
        self.d_min
    }

    /// 最大剂量 (Gy).
    #[inline]
    pub fn d_max(&self) -> f64 {
        self.d_max
    }

    /// 平均剂量 (Gy).
    #[inline]
    pub fn d_mean(&self) -> f64 {
        self.d_mean
    }

    /// Dx: 至少 `v` % 体积接收到的剂量 (Gy).
    ///
    /// 沿体积降序在曲线内部点上线性插值; `v` 超出曲线覆盖范围时
    /// 钳制到最小 / 最大剂量, 不做外推. `v = 50` 恰为剂量中位数.
    /// 空曲线返回 0.
    pub fn dose_at_volume(&self, v: f64) -> f64 {
        let n = self.dose.len();
        if n == 0 {
            return 0.0;
        }
        // 跳过两端哨兵, 只在体素点上插值.
        let dose = &self.dose[1..n - 1];
        let volume = &self.volume[1..n - 1];

        if v >= volume[0] {
            return dose[0];
        }
        if v <= *volume.last().unwrap() {
            return *dose.last().unwrap();
        }
        let points = dose.iter().copied().zip(volume.iter().copied());
        for ((d0, v0), (d1, v1)) in points.tuple_windows() {
            if v1 <= v && v <= v0 {
                // 内部体积严格递减, v0 > v1 恒成立.
                let t = (v0 - v) / (v0 - v1);
                return d0 + t * (d1 - d0);
            }
        }
        *dose.last().unwrap()
    }

    /// Vx: 接收剂量不低于 `d` Gy 的体积百分比.
    ///
    /// 沿剂量升序在曲线上线性插值; `d` 低于 0 时取 100,
    /// 不低于最大剂量时取 0, 不做外推. 空曲线返回 0.
    pub fn volume_at_dose(&self, d: f64) -> f64 {
        if self.dose.is_empty() {
            return 0.0;
        }
        if d <= self.dose[0] {
            return self.volume[0];
        }
        if d >= *self.dose.last().unwrap() {
            return *self.volume.last().unwrap();
        }
        for ((d0, v0), (d1, v1)) in self.cumulative().tuple_windows() {
            // 跳过重复剂量形成的垂直段.
            if d0 <= d && d <= d1 && d1 > d0 {
                let t = (d - d0) / (d1 - d0);
                return v0 + t * (v1 - v0);
            }
        }
        *self.volume.last().unwrap()
    }

    /// Vx 的剂量归一化形式: 接收剂量不低于处方剂量 `pct` % 的体积百分比.
    ///
    /// `prescription_gy` 必须为正, 否则 panic.
    #[inline]
    pub fn volume_at_dose_relative(&self, pct: f64, prescription_gy: f64) -> f64 {
        assert!(prescription_gy > 0.0, "处方剂量必须为正");
        self.volume_at_dose(pct / 100.0 * prescription_gy)
    }

    /// 计算常用标量指标汇总. 不含处方剂量相关指标 (V95/V100).
    #[inline]
    pub fn summary(&self) -> DvhSummary {
        DvhSummary {
            name: self.name.clone(),
            voxel_count: self.voxel_count,
            volume_cc: self.volume_cc,
            d_min: self.d_min,
            d_max: self.d_max,
            d_mean: self.d_mean,
            d_median: self.dose_at_volume(50.0),
            d98: self.dose_at_volume(98.0),
            d95: self.dose_at_volume(95.0),
            d90: self.dose_at_volume(90.0),
            d50: self.dose_at_volume(50.0),
            d2: self.dose_at_volume(2.0),
            v95: None,
            v100: None,
        }
    }

    /// 计算含处方剂量相关指标 (V95/V100) 的汇总.
    ///
    /// `prescription_gy` 必须为正, 否则 panic.
    pub fn summary_with_prescription(&self, prescription_gy: f64) -> DvhSummary {
        DvhSummary {
            v95: Some(self.volume_at_dose_relative(95.0, prescription_gy)),
            v100: Some(self.volume_at_dose_relative(100.0, prescription_gy)),
            ..self.summary()
        }
    }
}

/// DVH 常用标量指标汇总. 均为曲线与体素个数的纯函数.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DvhSummary {
    /// 结构名.
    pub name: String,

    /// 参与统计的体素个数.
    pub voxel_count: usize,

    /// 结构体积 (cc).
    pub volume_cc: f64,

    /// 最小剂量 (Gy).
    pub d_min: f64,

    /// 最大剂量 (Gy).
    pub d_max: f64,

    /// 平均剂量 (Gy).
    pub d_mean: f64,

    /// 剂量中位数 (Gy).
    pub d_median: f64,

    /// D98 (Gy).
    pub d98: f64,

    /// D95 (Gy).
    pub d95: f64,

    /// D90 (Gy).
    pub d90: f64,

    /// D50 (Gy).
    pub d50: f64,

    /// D2 (Gy).
    pub d2: f64,

    /// V95: 接收剂量不低于处方剂量 95% 的体积百分比.
    /// 仅在提供处方剂量时有值.
    pub v95: Option<f64>,

    /// V100: 接收剂量不低于处方剂量的体积百分比.
    /// 仅在提供处方剂量时有值.
    pub v100: Option<f64>,
}

impl DvhSummary {
    /// 均匀性指数 `HI = (D2 - D98) / D50`.
    ///
    /// D50 为 0 (如空结构) 时无定义, 返回 `None`.
    #[inline]
    pub fn homogeneity_index(&self) -> Option<f64> {
        (self.d50 != 0.0).then(|| (self.d2 - self.d98) / self.d50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{StructureKind, VoxelGrid};
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

    /// 中心 4x4x4 立方体 mask (索引 3..=6).
    fn cube_mask() -> StructureMask {
        let sel = Array3::from_shape_fn((10, 10, 10), |(z, h, w)| {
            (3..7).contains(&z) && (3..7).contains(&h) && (3..7).contains(&w)
        });
        StructureMask::new("cube", StructureKind::Target, sel)
    }

    /// 累积曲线体积百分比必须随剂量单调非增.
    #[test]
    fn test_cumulative_monotonicity() {
        let curve = DvhCurve::compute(&linear_field(), &cube_mask()).unwrap();
        let points: Vec<_> = curve.cumulative().collect();
        assert!(points.len() >= 3);
        for pair in points.windows(2) {
            assert!(pair[0].0 <= pair[1].0, "剂量必须非降");
            assert!(pair[0].1 >= pair[1].1, "体积必须非增");
        }
    }

    /// 边界性质: 0 Gy 处体积 100%, 超过最大剂量处体积 0%.
    #[test]
    fn test_boundary_values() {
        let curve = DvhCurve::compute(&linear_field(), &cube_mask()).unwrap();
        assert!(f64_eq(curve.volume_at_dose(0.0), 100.0));
        assert!(f64_eq(curve.volume_at_dose(-1.0), 100.0));
        assert!(f64_eq(curve.volume_at_dose(curve.d_max() + 0.1), 0.0));
        assert!(f64_eq(curve.volume_at_dose(1e6), 0.0));
    }

    /// 具体场景: 中心立方体的 D50 恰为解析中位数, 均值与解析值一致.
    #[test]
    fn test_linear_gradient_cube() {
        let curve = DvhCurve::compute(&linear_field(), &cube_mask()).unwrap();
        assert_eq!(curve.voxel_count(), 64);

        // z 层 3..=6 的剂量值: {3, 4, 5, 6} * 100 / 9, 各占 16 体素.
        // 中位数 = (400/9 + 500/9) / 2 = 50, 均值 = 450/9 = 50.
        assert!(f64_eq(curve.d_mean(), 50.0));
        assert!(f64_eq(curve.dose_at_volume(50.0), 50.0));
        assert!(f64_eq(curve.d_min(), 300.0 / 9.0));
        assert!(f64_eq(curve.d_max(), 600.0 / 9.0));

        // 体积 4^3 * 8 mm^3 = 512 mm^3.
        assert!(f64_eq(curve.volume_cc(), 0.512));
    }

    /// Dx 在边界百分位处钳制到端点剂量.
    #[test]
    fn test_dose_at_volume_clamping() {
        let curve = DvhCurve::compute(&linear_field(), &cube_mask()).unwrap();
        assert!(f64_eq(curve.dose_at_volume(100.0), curve.d_min()));
        assert!(f64_eq(curve.dose_at_volume(120.0), curve.d_min()));
        assert!(f64_eq(curve.dose_at_volume(0.0), curve.d_max()));
        assert!(f64_eq(curve.dose_at_volume(-5.0), curve.d_max()));
    }

    /// 微分直方图的体积百分比之和为 100%.
    #[test]
    fn test_differential_sums_to_100() {
        let curve = DvhCurve::compute_with_bins(&linear_field(), &cube_mask(), 50).unwrap();
        let total: f64 = curve.differential().map(|(_, v)| v).sum();
        assert!(f64_eq(total, 100.0));
        assert_eq!(curve.differential().len(), 50);
    }

    /// 空结构返回零体积曲线, 所有查询取中性值.
    #[test]
    fn test_empty_region() {
        let empty = StructureMask::new(
            "edited-away",
            StructureKind::Organ,
            Array3::from_elem((10, 10, 10), false),
        );
        let curve = DvhCurve::compute(&linear_field(), &empty).unwrap();
        assert!(curve.is_empty());
        assert_eq!(curve.voxel_count(), 0);
        assert!(f64_eq(curve.volume_cc(), 0.0));
        assert!(f64_eq(curve.dose_at_volume(50.0), 0.0));
        assert!(f64_eq(curve.volume_at_dose(10.0), 0.0));
    }

    /// 形状不一致与非法 bin 数是硬错误.
    #[test]
    fn test_invalid_input() {
        let field = linear_field();
        let wrong = StructureMask::new(
            "wrong",
            StructureKind::Organ,
            Array3::from_elem((5, 5, 5), true),
        );
        assert_eq!(
            DvhCurve::compute(&field, &wrong).unwrap_err(),
            EvalError::ShapeMismatch((10, 10, 10), (5, 5, 5))
        );
        assert!(matches!(
            DvhCurve::compute_with_bins(&field, &cube_mask(), 0).unwrap_err(),
            EvalError::InvalidParameter(_)
        ));
    }

    /// 汇总指标自洽: D98 <= D50 <= D2, HI 非负, 处方剂量指标按需出现.
    #[test]
    fn test_summary() {
        let curve = DvhCurve::compute(&linear_field(), &cube_mask()).unwrap();
        let s = curve.summary();
        assert!(s.d98 <= s.d50 && s.d50 <= s.d2);
        assert!(f64_eq(s.d_median, s.d50));
        assert!(s.v95.is_none() && s.v100.is_none());
        let hi = s.homogeneity_index().unwrap();
        assert!(hi >= 0.0);

        // 处方 50 Gy 恰为中位数: V100 = 50%.
        let s = curve.summary_with_prescription(50.0);
        assert!(f64_eq(s.v100.unwrap(), 50.0));
        assert!(s.v95.unwrap() > s.v100.unwrap());
    }
}
