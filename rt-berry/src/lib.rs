#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 提供放疗计划剂量学评估的三大工具: DVH 引擎,
//! 放射生物学响应模型 (EUD / TCP / NTCP), 以及 Gamma 指数分析.
//!
//! 该 crate 目前仅提供 `safe` 接口. 将来可能为部分高性能场景关键路径提供 `unsafe` 接口.
//!
//! # 数据模型
//!
//! 所有计算围绕三个对象展开:
//!
//! 1. [`VoxelGrid`]: 三维体素网格的几何描述 (维度, 间距, 原点),
//!    轴序固定为 `(z, h, w)`.
//! 2. [`DoseField`]: 网格上的标量剂量分布, 单位 Gy.
//! 3. [`StructureMask`]: 网格上的解剖结构布尔掩膜, 分靶区与危及器官两类.
//!
//! # 注意
//!
//! 1. 剂量场与掩膜在进入任何计算前都要求形状一致, 不一致时返回
//!    [`EvalError::ShapeMismatch`] 而非 panic.
//! 2. 空区域 (掩膜不含任何体素) 不是错误: 计算返回可检查的零值结果,
//!    并记入 `warn` 日志.
//! 3. 在非期望情况下, 程序会直接 panic, 而不会导致内存错误. As what Rust promises.
//!
//! # 功能组成
//!
//! ### 剂量体积直方图 (DVH)
//!
//! 累积与微分两种形式, 以及 D98/D2/HI 等计划质量摘要.
//!
//! 实现位于 `rt-berry/src/dvh.rs`.
//!
//! ### 放射生物学响应模型
//!
//! 广义 EUD, 靶区 TCP (logistic), 危及器官 NTCP (Lyman-Kutcher-Burman
//! 与 Relative Seriality 两种), 以及逐结构批量评估.
//!
//! 文献默认参数表位于 `rt-berry/src/radbio/params.rs`.
//!
//! ### Gamma 指数分析
//!
//! 参考 / 评估剂量场的 3%/3mm 类一致性分析, 支持全局与局部归一化,
//! 网格不一致时自动重采样, 并提供协作式取消.
//!
//! 实现位于 `rt-berry/src/gamma`.

/// 二维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 剂量网格基础数据结构.
mod data;

pub use data::{DoseField, StructureKind, StructureMask, VoxelGrid};

pub mod consts;

mod error;

pub use error::{EvalError, EvalResult};

pub mod dvh;
pub mod gamma;
pub mod prelude;
pub mod radbio;
