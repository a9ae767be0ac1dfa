//! Generated protobuf and gRPC bindings.
//!
//! - `relay::v1`: the router-facing `CommunicationService` (`Execute`)
//! - `function::v1`: the instance-facing `FunctionRunnerService` (`Invoke`)

pub mod relay {
    pub mod v1 {
        tonic::include_proto!("ignite.relay.v1");

        pub use communication_service_client::CommunicationServiceClient;
        pub use communication_service_server::{CommunicationService, CommunicationServiceServer};
    }
}

pub mod function {
    pub mod v1 {
        tonic::include_proto!("ignite.function.v1");

        pub use function_runner_service_client::FunctionRunnerServiceClient;
        pub use function_runner_service_server::{
            FunctionRunnerService, FunctionRunnerServiceServer,
        };
    }
}
