//! Protobuf messages for the kubelet pod-resources API
//!
//! Only the `v1.PodResourcesLister/List` call is used, so the handful of
//! messages it needs are declared by hand instead of generated.

pub mod podresources {
    pub mod v1 {
        use prost::Message;

        /// Full gRPC method path of `List`
        pub const LIST_METHOD: &str = "/v1.PodResourcesLister/List";

        #[derive(Clone, PartialEq, Message)]
        pub struct ListPodResourcesRequest {}

        #[derive(Clone, PartialEq, Message)]
        pub struct ListPodResourcesResponse {
            #[prost(message, repeated, tag = "1")]
            pub pod_resources: Vec<PodResources>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct PodResources {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(string, tag = "2")]
            pub namespace: String,
            #[prost(message, repeated, tag = "3")]
            pub containers: Vec<ContainerResources>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerResources {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(message, repeated, tag = "2")]
            pub devices: Vec<ContainerDevices>,
            #[prost(int64, repeated, tag = "3")]
            pub cpu_ids: Vec<i64>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerDevices {
            #[prost(string, tag = "1")]
            pub resource_name: String,
            #[prost(string, repeated, tag = "2")]
            pub device_ids: Vec<String>,
        }
    }
}
