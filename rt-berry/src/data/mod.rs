//! 剂量评估基础数据结构: 采样网格, 剂量场与结构 mask.

use std::ops::Index;

use ndarray::{Array3, ArrayView, Ix3};
use ordered_float::OrderedFloat;

use crate::error::{EvalError, EvalResult};
use crate::Idx3d;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 规则三维采样网格.
///
/// 形状与体素间距按照 `(z, h, w)` 顺序组织, 间距以毫米为单位.
/// 该结构是只读的. 多个剂量场可以通过值相等共享同一个网格,
/// 不要求别名共享.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VoxelGrid {
    shape: Idx3d,
    spacing: [f64; 3],
    origin: [f64; 3],
}

impl VoxelGrid {
    /// 构建网格. 原点取 `(0, 0, 0)`.
    ///
    /// `shape` 每一维必须非零, `spacing` 每一维必须为正且有限,
    /// 否则返回 `InvalidParameter`.
    pub fn new(shape: Idx3d, spacing: [f64; 3]) -> EvalResult<Self> {
        Self::with_origin(shape, spacing, [0.0; 3])
    }

    /// 构建带物理原点 (毫米) 的网格. 参数要求同 [`Self::new`].
    pub fn with_origin(shape: Idx3d, spacing: [f64; 3], origin: [f64; 3]) -> EvalResult<Self> {
        let (z, h, w) = shape;
        if z == 0 || h == 0 || w == 0 {
            return Err(EvalError::InvalidParameter(format!(
                "网格形状每一维必须非零: {shape:?}"
            )));
        }
        if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(EvalError::InvalidParameter(format!(
                "体素间距必须为正且有限: {spacing:?}"
            )));
        }
        Ok(Self {
            shape,
            spacing,
            origin,
        })
    }

    /// 获取数据形状大小.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.shape
    }

    /// 获取数据体素个数.
    #[inline]
    pub fn size(&self) -> usize {
        let (z, h, w) = self.shape;
        z * h * w
    }

    /// 获取水平切片个数.
    #[inline]
    pub fn len_z(&self) -> usize {
        self.shape.0
    }

    /// 检查索引是否合法.
    #[inline]
    pub fn check(&self, (z0, h0, w0): &Idx3d) -> bool {
        let (z, h, w) = self.shape;
        *z0 < z && *h0 < h && *w0 < w
    }

    /// 获取单个体素分辨率, 以毫米为单位, 分别代表空间 (相邻切片方向),
    /// 高 (自然图像的垂直方向), 宽 (自然图像的水平方向).
    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    /// 获取空间方向 (相邻 2D 切片的方向) 体素分辨率, 以毫米为单位.
    #[inline]
    pub fn z_mm(&self) -> f64 {
        self.spacing[0]
    }

    /// 获取 height 方向 (自然 2D 图像的垂直方向) 体素分辨率, 以毫米为单位.
    #[inline]
    pub fn height_mm(&self) -> f64 {
        self.spacing[1]
    }

    /// 获取 width 方向 (自然 2D 图像的水平方向) 体素分辨率, 以毫米为单位.
    #[inline]
    pub fn width_mm(&self) -> f64 {
        self.spacing[2]
    }

    /// 获取网格物理原点, 以毫米为单位.
    #[inline]
    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    /// 体素分辨率在三个维度上是否是各向同的?
    #[inline]
    pub fn is_isotropic(&self) -> bool {
        let [z, h, w] = self.spacing;
        z == h && z == w
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    pub fn voxel(&self) -> f64 {
        self.spacing.iter().product()
    }
}

/// 三维剂量场. 每个体素保存一个以 Gy 为单位的剂量值,
/// 并关联唯一一个 [`VoxelGrid`].
#[derive(Clone, Debug)]
pub struct DoseField {
    grid: VoxelGrid,
    data: Array3<f64>,
}

impl Index<Idx3d> for DoseField {
    type Output = f64;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl DoseField {
    /// 根据网格和剂量数据构建剂量场.
    ///
    /// `data` 的形状必须与 `grid` 一致, 否则返回 `ShapeMismatch`.
    pub fn new(grid: VoxelGrid, data: Array3<f64>) -> EvalResult<Self> {
        let found = data.dim();
        if found != grid.shape() {
            return Err(EvalError::ShapeMismatch(grid.shape(), found));
        }
        Ok(Self { grid, data })
    }

    /// 获取关联的采样网格.
    #[inline]
    pub fn grid(&self) -> &VoxelGrid {
        &self.grid
    }

    /// 获取数据形状大小.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.grid.shape()
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, f64, Ix3> {
        self.data.view()
    }

    /// 获取剂量场最大值 (Gy).
    ///
    /// 网格保证非空, 因此该值总是存在. NaN 体素会使结果无意义.
    #[inline]
    pub fn max_dose(&self) -> f64 {
        self.data
            .iter()
            .copied()
            .map(OrderedFloat)
            .max()
            .map(|v| v.0)
            .unwrap() // 网格构建时已排除空形状.
    }

    /// 获取剂量场平均值 (Gy).
    #[inline]
    pub fn mean_dose(&self) -> f64 {
        self.data.sum() / (self.grid.size() as f64)
    }

    /// 检查 `self` 与另一形状是否一致, 不一致则返回 `ShapeMismatch`.
    #[inline]
    pub(crate) fn check_shape(&self, found: Idx3d) -> EvalResult<()> {
        if self.shape() == found {
            Ok(())
        } else {
            Err(EvalError::ShapeMismatch(self.shape(), found))
        }
    }

    /// 收集 mask 覆盖的所有体素剂量值, 按行优先序存储.
    ///
    /// mask 形状与剂量场不一致时返回 `ShapeMismatch`, 绝不静默截断.
    pub fn values_in(&self, mask: &StructureMask) -> EvalResult<Vec<f64>> {
        self.check_shape(mask.shape())?;
        Ok(self
            .data
            .iter()
            .zip(mask.data().iter())
            .filter_map(|(dose, selected)| selected.then_some(*dose))
            .collect())
    }

    /// 将剂量场以三线性插值重采样到 `target` 网格上.
    ///
    /// 插值在归一化索引空间进行: 目标索引 `i` 对应源坐标
    /// `i * (n - 1) / (m - 1)` (目标维长为 1 时取 0).
    /// 源网格角点与目标网格角点始终重合.
    pub fn resample_to(&self, target: &VoxelGrid) -> DoseField {
        let (nz, nh, nw) = self.shape();
        let (mz, mh, mw) = target.shape();

        #[inline]
        fn step(n: usize, m: usize) -> f64 {
            if m <= 1 {
                0.0
            } else {
                (n as f64 - 1.0) / (m as f64 - 1.0)
            }
        }

        let (sz, sh, sw) = (step(nz, mz), step(nh, mh), step(nw, mw));
        let data = Array3::from_shape_fn((mz, mh, mw), |(i, j, k)| {
            self.sample_trilinear(i as f64 * sz, j as f64 * sh, k as f64 * sw)
        });

        Self {
            grid: target.clone(),
            data,
        }
    }

    /// 在 (浮点) 索引坐标处做三线性插值. 坐标必须落在网格范围内.
    fn sample_trilinear(&self, z: f64, h: f64, w: f64) -> f64 {
        let (nz, nh, nw) = self.shape();

        #[inline]
        fn split(v: f64, n: usize) -> (usize, usize, f64) {
            let lo = (v.floor() as usize).min(n - 1);
            let hi = (lo + 1).min(n - 1);
            (lo, hi, v - lo as f64)
        }

        let (z0, z1, fz) = split(z, nz);
        let (h0, h1, fh) = split(h, nh);
        let (w0, w1, fw) = split(w, nw);

        #[inline]
        fn lerp(a: f64, b: f64, t: f64) -> f64 {
            a + (b - a) * t
        }

        let c00 = lerp(self.data[(z0, h0, w0)], self.data[(z0, h0, w1)], fw);
        let c01 = lerp(self.data[(z0, h1, w0)], self.data[(z0, h1, w1)], fw);
        let c10 = lerp(self.data[(z1, h0, w0)], self.data[(z1, h0, w1)], fw);
        let c11 = lerp(self.data[(z1, h1, w0)], self.data[(z1, h1, w1)], fw);

        lerp(lerp(c00, c01, fh), lerp(c10, c11, fh), fz)
    }
}

/// 结构类型标签.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StructureKind {
    /// 靶区 (如 PTV). 评估时计算 TCP.
    Target,

    /// 危及器官. 评估时计算 NTCP.
    Organ,
}

impl StructureKind {
    /// 是否为靶区.
    #[inline]
    pub fn is_target(&self) -> bool {
        matches!(self, Self::Target)
    }
}

/// 解剖结构 mask: 结构名, 类型标签与体素级布尔归属.
///
/// mask 不持有网格, 其形状在每次与剂量场联合操作前强制检查.
#[derive(Clone, Debug)]
pub struct StructureMask {
    name: String,
    kind: StructureKind,
    data: Array3<bool>,
}

impl StructureMask {
    /// 构建结构 mask.
    #[inline]
    pub fn new(name: impl Into<String>, kind: StructureKind, data: Array3<bool>) -> Self {
        Self {
            name: name.into(),
            kind,
            data,
        }
    }

    /// 获取结构名.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 获取结构类型标签.
    #[inline]
    pub fn kind(&self) -> StructureKind {
        self.kind
    }

    /// 获取数据形状大小.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.data.dim()
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, bool, Ix3> {
        self.data.view()
    }

    /// 获取 mask 覆盖的体素个数.
    #[inline]
    pub fn count(&self) -> usize {
        self.data.iter().filter(|p| **p).count()
    }

    /// mask 是否不包含任何体素?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|p| !p)
    }

    /// 收集 mask 覆盖的所有体素下标, 结果按行优先存储.
    pub fn positions(&self) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(ref pos, selected)| selected.then_some(*pos))
            .collect()
    }

    /// 获取结构在 `grid` 上的实际体积, 以立方厘米为单位.
    ///
    /// mask 形状与网格不一致时返回 `ShapeMismatch`.
    pub fn volume_cc(&self, grid: &VoxelGrid) -> EvalResult<f64> {
        if self.shape() != grid.shape() {
            return Err(EvalError::ShapeMismatch(grid.shape(), self.shape()));
        }
        Ok(self.count() as f64 * grid.voxel() / 1000.0)
    }
}
