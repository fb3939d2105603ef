//! Wire protocol for the cluster RPC surface
//!
//! Three streaming endpoints per peer: client-streaming `Write`,
//! server-streaming `Read`, and bidirectional `GetMeta`. Message types are
//! prost structs; the client mirrors what `tonic-build` emits for the
//! `timeseries.Timeseries` service so the crate carries no protoc step.

/// A point on the wire, qualified by its series identity
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Point {
    /// Keyset id
    #[prost(string, tag = "1")]
    pub ksid: String,
    /// Time-series id
    #[prost(string, tag = "2")]
    pub tsid: String,
    /// Timestamp in unix seconds
    #[prost(int64, tag = "3")]
    pub date: i64,
    /// Sample value
    #[prost(float, tag = "4")]
    pub value: f32,
}

impl Point {
    /// Composite series key, used to group points in the WAL
    pub fn ksts(&self) -> String {
        format!("{}|{}", self.ksid, self.tsid)
    }
}

/// Acknowledgement closing a write stream
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteAck {
    /// Points the peer accepted
    #[prost(int64, tag = "1")]
    pub accepted: i64,
}

/// Range query for one series
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Query {
    /// Keyset id
    #[prost(string, tag = "1")]
    pub ksid: String,
    /// Time-series id
    #[prost(string, tag = "2")]
    pub tsid: String,
    /// Range start, unix seconds inclusive
    #[prost(int64, tag = "3")]
    pub start: i64,
    /// Range end, unix seconds inclusive
    #[prost(int64, tag = "4")]
    pub end: i64,
}

/// Metadata lookup request
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Meta {
    /// Keyset id
    #[prost(string, tag = "1")]
    pub ksid: String,
    /// Time-series id
    #[prost(string, tag = "2")]
    pub tsid: String,
    /// Metric name
    #[prost(string, tag = "3")]
    pub metric: String,
}

/// Metadata lookup answer
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetaFound {
    /// Composite series key the answer refers to
    #[prost(string, tag = "1")]
    pub ksts: String,
    /// Whether the peer knows the series
    #[prost(bool, tag = "2")]
    pub ok: bool,
}

/// Generated client implementations.
pub mod timeseries_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]

    use tonic::codegen::http::Uri;
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct TimeseriesClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl TimeseriesClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> TimeseriesClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }

        pub async fn write(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::Point>,
        ) -> std::result::Result<tonic::Response<super::WriteAck>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/timeseries.Timeseries/Write");
            let mut req = request.into_streaming_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("timeseries.Timeseries", "Write"));
            self.inner.client_streaming(req, path, codec).await
        }

        pub async fn read(
            &mut self,
            request: impl tonic::IntoRequest<super::Query>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::Point>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/timeseries.Timeseries/Read");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("timeseries.Timeseries", "Read"));
            self.inner.server_streaming(req, path, codec).await
        }

        pub async fn get_meta(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::Meta>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::MetaFound>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/timeseries.Timeseries/GetMeta");
            let mut req = request.into_streaming_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("timeseries.Timeseries", "GetMeta"));
            self.inner.streaming(req, path, codec).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_point_encode_roundtrip() {
        let point = Point {
            ksid: "ks".into(),
            tsid: "ts".into(),
            date: 1_000_000,
            value: 3.5,
        };

        let buf = point.encode_to_vec();
        let decoded = Point::decode(buf.as_slice()).unwrap();
        assert_eq!(decoded, point);
        assert_eq!(decoded.ksts(), "ks|ts");
    }
}
