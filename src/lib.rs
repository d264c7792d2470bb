//! Bee Planner - 任务规划与执行子系统
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、状态机、取消监管、协调循环（TaskEngine）
//! - **execution**: 工具编排、工作池、结果处理
//! - **human**: 人工输入通道（澄清、审批、升级通知）
//! - **llm**: 推理后端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 记忆存储
//! - **observability**: tracing 初始化
//! - **planner**: 分解、路线图、校验、进度跟踪
//! - **tools**: 工具注册表、内置工具与执行器

pub mod config;
pub mod core;
pub mod execution;
pub mod human;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod planner;
pub mod tools;

pub use crate::core::{
    create_engine_builder, EngineBuilder, EngineParts, PlanError, TaskEngine, TaskId, TaskState,
};
