#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

use alloy::sol;

sol!(
    /// Events of the order API consumer contract.
    interface OrderApiConsumer {
        event ChainlinkRequested(bytes32 indexed id);
        event ChainlinkFulfilled(bytes32 indexed id);
    }
);

sol!(
    /// Events of the order API oracle contract.
    interface OrderApiOracle {
        event OracleRequest(
            bytes32 indexed specId,
            address requester,
            bytes32 requestId,
            uint256 payment,
            address callbackAddr,
            bytes4 callbackFunctionId,
            uint256 cancelExpiration,
            uint256 dataVersion,
            bytes data
        );
    }
);
