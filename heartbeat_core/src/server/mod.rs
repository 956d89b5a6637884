// heartbeat_core/src/server/mod.rs

//! WebSocket 服务端传输层。
//!
//! `transport` 子模块负责在给定的 TCP 监听器上接受连接并完成 WebSocket 握手，
//! 把握手成功的流交给上层回调。心跳相关的连接适配与事件发布由服务端 crate 完成。

pub mod transport;
