// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod binding;
pub mod broker;
pub mod codec;
pub mod configs;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod headers;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod rabbitmq;
pub mod routing;
pub mod rpc_client;
pub mod rpc_server;
pub mod subscriber;
pub mod subscription;
pub mod topology;
