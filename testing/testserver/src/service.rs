use tonic::{Request, Response, Status};

use crate::pb;

#[derive(Debug, Default)]
pub struct GreeterImpl;

#[tonic::async_trait]
impl pb::greeter_server::Greeter for GreeterImpl {
    async fn say_hello(
        &self,
        request: Request<pb::HelloRequest>,
    ) -> Result<Response<pb::HelloReply>, Status> {
        let name = request.into_inner().name;
        Ok(Response::new(pb::HelloReply {
            message: format!("Hello {name}"),
        }))
    }
}

#[derive(Debug, Default)]
pub struct ItemsImpl;

#[tonic::async_trait]
impl pb::items_server::Items for ItemsImpl {
    async fn create_item(
        &self,
        request: Request<pb::CreateItemRequest>,
    ) -> Result<Response<pb::Item>, Status> {
        let req = request.into_inner();
        Ok(Response::new(pb::Item {
            id: req.id,
            tags: req.tags,
        }))
    }
}

#[derive(Debug, Default)]
pub struct UsersImpl;

#[tonic::async_trait]
impl pb::users_server::Users for UsersImpl {
    async fn get_user(
        &self,
        request: Request<pb::GetUserRequest>,
    ) -> Result<Response<pb::User>, Status> {
        let req = request.into_inner();
        Ok(Response::new(pb::User {
            id: req.id,
            verbose: req.verbose,
        }))
    }

    type StreamUsersStream = tokio_stream::wrappers::ReceiverStream<Result<pb::User, Status>>;

    async fn stream_users(
        &self,
        request: Request<pb::GetUserRequest>,
    ) -> Result<Response<Self::StreamUsersStream>, Status> {
        let req = request.into_inner();
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let user = pb::User {
            id: req.id,
            verbose: req.verbose,
        };
        tokio::spawn(async move {
            let _ = tx.send(Ok(user)).await;
        });
        Ok(Response::new(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}
