//! 运行时错误.

use crate::Idx3d;

/// 剂量学评估的运行时错误.
///
/// 注意两类非致命事件不在此列:
///
/// 1. 空结构 (mask 不含任何体素) 会返回中性结果并通过 `log` 发出通知,
///   详见 [`crate::dvh::DvhCurve::is_empty`].
/// 2. 两个剂量场网格不一致时会自动重采样并记录事件,
///   详见 [`crate::gamma::GammaResult::resampled`].
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// 剂量场与结构 mask (或两个剂量场) 的网格形状不一致.
    ///
    /// 第一个参数为期望形状, 第二个参数为实际形状.
    ShapeMismatch(Idx3d, Idx3d),

    /// 模型参数超出有效域 (如 EUD 指数为 0, 负的判据值等).
    ///
    /// 参数描述具体原因.
    InvalidParameter(String),

    /// 归一化分母为 0 (如参考剂量场全局最大值为 0).
    NormalizationError,

    /// 计算被调用方主动取消. 不产生任何部分结果.
    Cancelled,
}

/// 剂量学评估结果类型.
pub type EvalResult<T> = Result<T, EvalError>;
