//! Server error code table

pub const NO_ERROR: u64 = 0;
pub const MALFORMED_MESSAGE: u64 = 1;
pub const FILE_IS_NOT_OPEN: u64 = 3;
pub const FILE_OPENED_IN_READ_MODE: u64 = 4;
pub const OPERATION_NOT_PERMITTED_FOR_FILE_TYPE: u64 = 5;
pub const BLOCK_SIZE_IS_TOO_LARGE: u64 = 6;
pub const INVALID_EDIT: u64 = 7;
pub const TOO_MANY_FILES_OPEN: u64 = 9;
pub const INVALID_BATCH_OPERATION: u64 = 10;
pub const BATCH_EDIT_OPERATION_NOT_SEQUENTIAL: u64 = 11;
pub const INVALID_USERNAME_PASSWORD: u64 = 100;
pub const UNAUTHORIZED_OPERATION: u64 = 102;
pub const UNKNOWN_FILE: u64 = 105;
pub const FAILED_TO_CONSUME_AUTHENTICATION_TOKEN: u64 = 111;
pub const INVALID_NODE_ID: u64 = 200;
pub const DIRECTORY_IS_NOT_EMPTY: u64 = 201;
pub const INVALID_PATH: u64 = 203;
pub const ELEMENT_WITH_NAME_ALREADY_EXISTS: u64 = 209;
pub const REVISION_TOO_OLD: u64 = 302;
pub const OFFSET_AND_SIZE_DO_NOT_MAP_TO_PART_OF_FILE: u64 = 303;

/// Human readable name of a server error code
pub fn describe(code: u64) -> Option<&'static str> {
	let name = match code {
		0 => "NoError",
		1 => "MalformedMessage",
		2 => "InternalCommunicationError",
		3 => "FileIsNotOpen",
		4 => "FileOpenedInReadMode",
		5 => "OperationNotPermittedForFileType",
		6 => "BlockSizeIsTooLarge",
		7 => "InvalidEdit",
		8 => "FailedToReceiveData",
		9 => "TooManyFilesOpen",
		10 => "InvalidBatchOperation",
		11 => "BatchEditOperationNotSequential",
		12 => "InvalidBlockSize",
		100 => "InvalidUsernamePassword",
		101 => "ParentIsNotDirectory",
		102 => "UnauthorizedOperation",
		103 => "InternalCommunicationError",
		104 => "InternalError",
		105 => "UnknownFile",
		106 => "UnknownAuthority",
		107 => "AuthorityError",
		108 => "InvalidPageSize",
		109 => "FailedToResolveAuthority",
		110 => "FailedToAllocateAuthenticationToken",
		111 => "FailedToConsumeAuthenticationToken",
		200 => "InvalidNodeId",
		201 => "DirectoryIsNotEmpty",
		202 => "InvalidPathSize",
		203 => "InvalidPath",
		204 => "HostFilesystemError",
		205 => "AllNodesInUse",
		206 => "ParentIsNotDirectory",
		207 => "NodeIsNotFile",
		208 => "NodeIsNotDirectory",
		209 => "ElementWithNameAlreadyExists",
		300 => "InternalCommunicationError",
		301 => "InternalError",
		302 => "RevisionTooOld",
		303 => "OffsetAndSizeDoNotMapToPartOfFile",
		304 => "DeleteIsOnlyAllowedForLastPart",
		305 => "FileLockedByOtherUser",
		306 => "FileNotLocked",
		307 => "InvalidOffsets",
		_ => return None,
	};
	Some(name)
}

/// Like `describe`, but never fails
pub fn describe_or_unknown(code: u64) -> String {
	match describe(code) {
		Some(name) => name.to_string(),
		None => format!("UnknownError({})", code),
	}
}


// vim: ts=4
