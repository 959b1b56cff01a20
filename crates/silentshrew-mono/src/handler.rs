//! JSON-RPC method dispatch for the read service.

use serde_json::{json, Value};

use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use crate::service::ScalarService;

pub async fn handle_request(request: &JsonRpcRequest, service: &ScalarService) -> JsonRpcResponse {
    match request.method.as_str() {
        "silentshrew_getblockscalars" => {
            let height = match height_param(&request.params) {
                Ok(height) => height,
                Err(message) => {
                    return JsonRpcResponse::error(
                        INVALID_PARAMS,
                        message.to_string(),
                        request.id.clone(),
                    )
                }
            };
            match service.scalars_by_height(height).await {
                Ok(scalars) => {
                    JsonRpcResponse::success(json!({ "scalars": scalars }), request.id.clone())
                }
                Err(err) => {
                    JsonRpcResponse::error(INTERNAL_ERROR, err.to_string(), request.id.clone())
                }
            }
        }
        "silentshrew_getblockfilter" => {
            let height = match height_param(&request.params) {
                Ok(height) => height,
                Err(message) => {
                    return JsonRpcResponse::error(
                        INVALID_PARAMS,
                        message.to_string(),
                        request.id.clone(),
                    )
                }
            };
            match service.block_filter(height).await {
                Ok((filter, blockhash)) => JsonRpcResponse::success(
                    json!({ "filter": filter, "blockhash": blockhash }),
                    request.id.clone(),
                ),
                Err(err) => {
                    JsonRpcResponse::error(INTERNAL_ERROR, err.to_string(), request.id.clone())
                }
            }
        }
        "silentshrew_getchaintipheight" => match service.chain_tip().await {
            Ok(height) => {
                JsonRpcResponse::success(json!({ "height": height }), request.id.clone())
            }
            Err(err) => JsonRpcResponse::error(INTERNAL_ERROR, err.to_string(), request.id.clone()),
        },
        method => JsonRpcResponse::error(
            METHOD_NOT_FOUND,
            format!("unknown method: {method}"),
            request.id.clone(),
        ),
    }
}

fn height_param(params: &[Value]) -> Result<u32, &'static str> {
    params
        .first()
        .and_then(|value| value.as_u64())
        .and_then(|value| u32::try_from(value).ok())
        .ok_or("block height parameter required")
}
