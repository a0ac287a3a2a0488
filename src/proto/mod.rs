//! Generated control-channel types (see `proto/agent.proto`).

pub mod agent {
    tonic::include_proto!("paasdeploy.agent.v1");
}
