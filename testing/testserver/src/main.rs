use clap::Parser;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;

use testserver::pb::test_service_server::TestServiceServer;
use testserver::pb::FILE_DESCRIPTOR_SET;
use testserver::TestServiceImpl;

#[derive(Parser, Debug)]
#[command(name = "testserver", about = "Test gRPC server for grpcdeck verification")]
struct Cli {
    /// Port to listen on (0 for ephemeral)
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,

    /// Disable server reflection
    #[arg(long = "noreflect")]
    noreflect: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let addr: std::net::SocketAddr = format!("127.0.0.1:{}", cli.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Listening on {}", listener.local_addr()?);

    let test_service = TestServiceServer::new(TestServiceImpl);
    let mut builder = Server::builder();

    if cli.noreflect {
        builder
            .add_service(test_service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await?;
    } else {
        let reflection_v1 = ReflectionBuilder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()?;
        let reflection_v1alpha = ReflectionBuilder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;

        builder
            .add_service(reflection_v1)
            .add_service(reflection_v1alpha)
            .add_service(test_service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await?;
    }

    Ok(())
}
