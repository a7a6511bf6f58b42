//! 通用常量.

/// 靶区 EUD 计算使用的固定指数 a. 典型的肿瘤组织取值.
pub const TARGET_EUD_A: f64 = 0.1;

/// DVH 微分直方图默认 bin 数.
pub const DEFAULT_DVH_BINS: usize = 100;

/// DVH 微分直方图上限相对最大剂量的余量系数.
pub const DVH_DOSE_HEADROOM: f64 = 1.1;

/// Gamma 分析默认剂量判据, 单位为参考剂量最大值的百分比.
pub const DEFAULT_DOSE_CRITERIA_PCT: f64 = 3.0;

/// Gamma 分析默认距离判据 (DTA), 以毫米为单位.
pub const DEFAULT_DISTANCE_CRITERIA_MM: f64 = 3.0;

/// Gamma 分析默认剂量纳入阈值, 单位为归一化参考剂量的百分比.
/// 低于该阈值的体素不参与统计.
pub const DEFAULT_THRESHOLD_PCT: f64 = 10.0;

/// Gamma 搜索半径相对距离判据的默认倍数.
///
/// 超出该半径的候选点永远不会被检查. 这是有意的运行时/精度折衷,
/// 临床上合适的半径属于标定问题, 由调用方通过
/// [`crate::gamma::GammaCriteria::search_radius_factor`] 调整.
pub const DEFAULT_SEARCH_RADIUS_FACTOR: f64 = 3.0;

/// QA 判定的默认 Gamma 通过率下限 (%).
pub const DEFAULT_PASS_RATE_THRESHOLD: f64 = 95.0;

/// QA 判定的默认最大 Gamma 值上限.
pub const DEFAULT_MAX_GAMMA_THRESHOLD: f64 = 2.0;
